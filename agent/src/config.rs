//! Configuration management for the reference worker client
//!
//! Loads an `agent.toml` file into a `shared::config::AgentConfig`, applying
//! any command-line overrides and persisting them -- the same load/
//! override/persist shape as `server::config::ConfigManager`.

use anyhow::{Context, Result};
use shared::config::AgentConfig;
use std::path::PathBuf;
use tracing::{debug, info};

const AGENT_CONFIG_FILE: &str = "agent.toml";

pub struct ConfigManager {
    pub config_path: PathBuf,
    pub agent_config: AgentConfig,
}

impl ConfigManager {
    pub fn new(path: PathBuf) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(AGENT_CONFIG_FILE)
        } else {
            path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "agent configuration file not found at {}",
                config_path.display()
            ));
        }

        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let agent_config: AgentConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        agent_config.validate().context("invalid agent configuration")?;
        debug!(path = %config_path.display(), "loaded agent configuration");

        Ok(Self {
            config_path,
            agent_config,
        })
    }

    pub fn apply_overrides(
        &mut self,
        server_url: Option<String>,
        listen_address: Option<String>,
    ) -> Result<bool> {
        let mut changed = false;
        if let Some(url) = server_url {
            if self.agent_config.server_url != url {
                self.agent_config.server_url = url;
                changed = true;
            }
        }
        if let Some(addr) = listen_address {
            if self.agent_config.listen_address != addr {
                self.agent_config.listen_address = addr;
                changed = true;
            }
        }
        if changed {
            self.agent_config
                .validate()
                .context("configuration invalid after applying overrides")?;
            let toml = toml::to_string_pretty(&self.agent_config)
                .context("failed to serialize agent config")?;
            std::fs::write(&self.config_path, toml)
                .with_context(|| format!("failed to write {}", self.config_path.display()))?;
            info!(path = %self.config_path.display(), "persisted configuration overrides");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::JobRef;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join(AGENT_CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
agent_id = 1
name = "worker-a"
server_url = "http://127.0.0.1:8888"
listen_address = "127.0.0.1:9001"
jobs = [{{ name = "demo", ver = 1 }}]
"#
        )
        .unwrap();
        path
    }

    #[test]
    fn loads_valid_config() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path());
        let manager = ConfigManager::new(path).unwrap();
        assert_eq!(manager.agent_config.name, "worker-a");
        assert_eq!(
            manager.agent_config.jobs,
            vec![JobRef {
                name: "demo".into(),
                ver: 1
            }]
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(ConfigManager::new(path).is_err());
    }

    #[test]
    fn overrides_persist_to_disk() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path());
        let mut manager = ConfigManager::new(path.clone()).unwrap();
        let changed = manager
            .apply_overrides(Some("http://example.com".to_string()), None)
            .unwrap();
        assert!(changed);

        let reloaded = ConfigManager::new(path).unwrap();
        assert_eq!(reloaded.agent_config.server_url, "http://example.com");
    }
}
