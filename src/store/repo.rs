use std::path::Path;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::keystore::Keystore;
use crate::store::db::MeshDb;
use crate::store::episodes;
use crate::store::paths::MeshPaths;
use crate::witness::WitnessSidecars;

/// Everything a command needs for one repository: layout, tunables, the
/// shared store, the keystore and the witness sidecars.
pub struct MeshRepo {
    pub paths: MeshPaths,
    pub config: MeshConfig,
    pub db: MeshDb,
    pub keystore: Keystore,
    pub witnesses: WitnessSidecars,
}

impl MeshRepo {
    /// Open an initialized repository. Fails with `NotInitialized` when the
    /// state directory has no store yet.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let paths = MeshPaths::for_root(repo_root);
        if !paths.is_initialized() {
            return Err(MeshError::NotInitialized);
        }
        let config = paths.config()?;
        let db = MeshDb::from_paths(&paths)?;
        let keystore = Keystore::for_paths(&paths);
        let witnesses = WitnessSidecars::new(paths.witnesses_dir());
        Ok(Self {
            paths,
            config,
            db,
            keystore,
            witnesses,
        })
    }

    /// The explicit episode, else the open one (if any).
    pub fn episode_or_current(&self, explicit: Option<String>) -> Result<Option<String>> {
        match explicit.filter(|e| !e.trim().is_empty()) {
            Some(id) => Ok(Some(id)),
            None => episodes::current_episode(&self.paths),
        }
    }

    /// Like [`episode_or_current`](Self::episode_or_current) but an episode
    /// is mandatory.
    pub fn require_episode(&self, explicit: Option<String>) -> Result<String> {
        self.episode_or_current(explicit)?
            .ok_or(MeshError::NoCurrentEpisode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_requires_init() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            MeshRepo::open(dir.path()),
            Err(MeshError::NotInitialized)
        ));

        let paths = MeshPaths {
            repo_root: dir.path().to_path_buf(),
            state_dir: dir.path().join(".agentmesh"),
        };
        paths.init().unwrap();
        MeshDb::from_paths(&paths).unwrap();

        let repo = MeshRepo::open(dir.path()).unwrap();
        assert_eq!(repo.config, MeshConfig::default());
        assert_eq!(repo.episode_or_current(None).unwrap(), None);
        assert!(matches!(
            repo.require_episode(None),
            Err(MeshError::NoCurrentEpisode)
        ));
        assert_eq!(
            repo.require_episode(Some("ep_explicit".into())).unwrap(),
            "ep_explicit"
        );
    }
}
