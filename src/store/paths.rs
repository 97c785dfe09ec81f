use std::fs;
use std::path::{Path, PathBuf};

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};

pub const STATE_DIR: &str = ".agentmesh";
pub const DB_FILE: &str = "mesh.db";
pub const CURRENT_EPISODE_FILE: &str = "current_episode";
pub const STATE_LOCK_FILE: &str = "state.lock";

/// On-disk layout of the agentmesh state directory.
///
///   - `mesh.db`          shared SQLite store
///   - `config.yaml`      tunables
///   - `current_episode`  id of the open episode
///   - `state.lock`       advisory lock for file-based state
///   - `keys/`            Ed25519 keystore
///   - `witnesses/`       witness sidecars
#[derive(Debug, Clone)]
pub struct MeshPaths {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
}

impl MeshPaths {
    /// Layout for a repository root, honouring `AGENTMESH_DATA_DIR`.
    pub fn for_root(repo_root: &Path) -> Self {
        let state_dir = match std::env::var("AGENTMESH_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => repo_root.join(STATE_DIR),
        };
        Self {
            repo_root: repo_root.to_path_buf(),
            state_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join(DB_FILE)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.state_dir.join("keys")
    }

    pub fn witnesses_dir(&self) -> PathBuf {
        self.state_dir.join("witnesses")
    }

    pub fn current_episode_path(&self) -> PathBuf {
        self.state_dir.join(CURRENT_EPISODE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(STATE_LOCK_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.join(DB_FILE).exists()
    }

    pub fn config(&self) -> Result<MeshConfig> {
        MeshConfig::load(&self.state_dir)
    }

    /// Create the state directory, default config, and subdirectories.
    pub fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(MeshError::AlreadyInitialized);
        }
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(self.keys_dir())?;
        fs::create_dir_all(self.witnesses_dir())?;
        if !self.state_dir.join(crate::config::CONFIG_FILE).exists() {
            MeshConfig::write_default(&self.state_dir)?;
        }
        Ok(())
    }
}

/// Walk up from the current directory to the first ancestor holding
/// `.agentmesh/`. `AGENTMESH_DATA_DIR` short-circuits the search and the
/// current directory is taken as the root.
pub fn find_repo_root() -> Result<PathBuf> {
    let mut dir = std::env::current_dir().map_err(MeshError::Io)?;
    if std::env::var("AGENTMESH_DATA_DIR").is_ok_and(|v| !v.trim().is_empty()) {
        return Ok(dir);
    }
    loop {
        if dir.join(STATE_DIR).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(MeshError::NotInitialized);
        }
    }
}
