use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use crate::error::{MeshError, Result};

const FIRST_DELAY: Duration = Duration::from_millis(1);
const MAX_DELAY: Duration = Duration::from_millis(512);

/// Acquire an exclusive advisory lock on `path`, retrying with exponential
/// backoff (1ms doubling to 512ms) before giving up with `Locked`.
/// The lock is released when the returned File is dropped.
pub fn acquire_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let mut delay = FIRST_DELAY;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if delay <= MAX_DELAY => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(_) => {
                tracing::warn!(path = %path.display(), "gave up waiting for state lock");
                return Err(MeshError::Locked(path.display().to_string()));
            }
        }
    }
}

/// Release lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    FileExt::unlock(&file)?;
    Ok(())
}

/// Run `f` while holding the lock at `path`.
pub fn with_lock<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let file = acquire_lock(path)?;
    let out = f();
    release_lock(file)?;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("state.lock");

        let file = acquire_lock(&lock_path).unwrap();
        assert!(acquire_lock(&lock_path).is_err());
        release_lock(file).unwrap();
        let _file = acquire_lock(&lock_path).unwrap();
    }

    #[test]
    fn with_lock_releases_on_error() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("state.lock");

        let result: Result<()> = with_lock(&lock_path, || {
            Err(MeshError::InvalidInput("boom".into()))
        });
        assert!(result.is_err());
        let value = with_lock(&lock_path, || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }
}
