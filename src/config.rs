use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const CONFIG_FILE: &str = "config.yaml";

/// Tunables read from `.agentmesh/config.yaml`. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub claim_ttl_secs: i64,
    pub lease_ttl_secs: i64,
    pub stale_agent_secs: i64,
    pub spawn_timeout_secs: i64,
    pub wait_poll_millis: u64,
    pub witness_chunk_size: usize,
    pub accept_legacy_packs: bool,
    pub log_level: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: 1800,
            lease_ttl_secs: 300,
            stale_agent_secs: 300,
            spawn_timeout_secs: 1800,
            wait_poll_millis: 200,
            witness_chunk_size: 180,
            accept_legacy_packs: false,
            log_level: "warn".to_string(),
        }
    }
}

impl MeshConfig {
    /// Load the config from a state directory, falling back to defaults when
    /// the file does not exist. `AGENTMESH_LOG` overrides `log_level`.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&raw)?
            }
        } else {
            Self::default()
        };
        if let Ok(level) = std::env::var("AGENTMESH_LOG")
            && !level.trim().is_empty()
        {
            config.log_level = level.trim().to_string();
        }
        if config.witness_chunk_size == 0 {
            config.witness_chunk_size = Self::default().witness_chunk_size;
        }
        Ok(config)
    }

    pub fn write_default(state_dir: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(&Self::default())?;
        fs::write(state_dir.join(CONFIG_FILE), raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = MeshConfig::load(dir.path()).unwrap();
        assert_eq!(config.claim_ttl_secs, 1800);
        assert_eq!(config.lease_ttl_secs, 300);
        assert!(!config.accept_legacy_packs);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "lease_ttl_secs: 60\naccept_legacy_packs: true\n",
        )
        .unwrap();
        let config = MeshConfig::load(dir.path()).unwrap();
        assert_eq!(config.lease_ttl_secs, 60);
        assert!(config.accept_legacy_packs);
        assert_eq!(config.witness_chunk_size, 180);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "lease_ttl_secs: [nope").unwrap();
        assert!(MeshConfig::load(dir.path()).is_err());
    }

    #[test]
    fn default_file_round_trips() {
        let dir = tempdir().unwrap();
        MeshConfig::write_default(dir.path()).unwrap();
        let config = MeshConfig::load(dir.path()).unwrap();
        assert_eq!(config, MeshConfig::default());
    }
}
