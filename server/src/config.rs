//! Configuration management for the coordination server
//!
//! Loads a `server.toml` file into a `shared::config::ServerConfig`, applies
//! any command-line overrides, and persists the result back to disk.

use anyhow::{Context, Result};
use shared::config::ServerConfig;
use std::path::PathBuf;
use tracing::{debug, info};

const SERVER_CONFIG_FILE: &str = "server.toml";

/// Owns the server's configuration for the lifetime of the process: loads it
/// once at startup, applies CLI overrides, and persists changes back to disk.
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub server_config: ServerConfig,
}

impl ConfigManager {
    /// Loads configuration from `path`. If `path` is a directory, looks for
    /// `server.toml` inside it; if the file does not exist, a default
    /// configuration is written there so the next run has something to edit.
    pub fn new(path: PathBuf) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(SERVER_CONFIG_FILE)
        } else {
            path
        };

        let server_config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let config: ServerConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", config_path.display()))?;
            config.validate().context("invalid server configuration")?;
            debug!(path = %config_path.display(), "loaded server configuration");
            config
        } else {
            info!(path = %config_path.display(), "no config file found, writing defaults");
            let config = ServerConfig::default();
            Self::persist(&config_path, &config)?;
            config
        };

        Ok(Self {
            config_path,
            server_config,
        })
    }

    fn persist(path: &PathBuf, config: &ServerConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let toml = toml::to_string_pretty(config).context("failed to serialize server config")?;
        std::fs::write(path, toml)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Applies any CLI overrides present, persists the result, and reports
    /// whether anything actually changed.
    pub fn apply_overrides(
        &mut self,
        listen_address: Option<String>,
        database_path: Option<String>,
    ) -> Result<bool> {
        let mut changed = false;
        if let Some(addr) = listen_address {
            if self.server_config.listen_address != addr {
                self.server_config.listen_address = addr;
                changed = true;
            }
        }
        if let Some(path) = database_path {
            if self.server_config.database_path != path {
                self.server_config.database_path = path;
                changed = true;
            }
        }

        if changed {
            self.server_config
                .validate()
                .context("configuration invalid after applying overrides")?;
            Self::persist(&self.config_path, &self.server_config)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_and_reloads_default_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let manager = ConfigManager::new(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(manager.server_config.listen_address, "0.0.0.0:8888");
    }

    #[test]
    fn applies_and_persists_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let mut manager = ConfigManager::new(path.clone()).unwrap();
        let changed = manager
            .apply_overrides(Some("127.0.0.1:9999".to_string()), None)
            .unwrap();
        assert!(changed);
        assert_eq!(manager.server_config.listen_address, "127.0.0.1:9999");

        let reloaded = ConfigManager::new(path).unwrap();
        assert_eq!(reloaded.server_config.listen_address, "127.0.0.1:9999");
    }
}
