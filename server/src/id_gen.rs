//! Monotonic task id generation.
//!
//! Task ids only need to be unique within this process and strictly
//! increasing for human-readable ordering in logs; no cross-process id
//! coordination is required since task groups are singly owned by one
//! monitor. A millisecond timestamp shifted into the high bits plus a
//! wrapping per-millisecond sequence counter is enough.

use std::sync::atomic::{AtomicI64, Ordering};

pub struct IdGenerator {
    last_millis: AtomicI64,
    sequence: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(0),
            sequence: AtomicI64::new(0),
        }
    }

    pub fn next_id(&self) -> i64 {
        let now = shared::domain::now_millis();
        let prev = self.last_millis.swap(now, Ordering::SeqCst);
        let seq = if prev == now {
            self.sequence.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.sequence.store(0, Ordering::SeqCst);
            0
        };
        (now << 12) | (seq & 0xFFF)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let gen = IdGenerator::new();
        let mut last = 0;
        for _ in 0..50 {
            let id = gen.next_id();
            assert!(id > last);
            last = id;
        }
    }
}
