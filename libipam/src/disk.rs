use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use log::debug;
use nix::fcntl::{Flock, FlockArg};
use tempfile::NamedTempFile;

use crate::error::PoolError;
use crate::pool::PoolState;

const STATE_EXT: &str = "json";
const LOCK_EXT: &str = "lock";

/// On-disk home of one network's pool: `<dir>/<name>.json` plus the
/// `<dir>/<name>.lock` file used for cross-process exclusion.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
    name: String,
}

impl Store {
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Result<Self, PoolError> {
        let dir = dir.as_ref();
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .map_err(|e| PoolError::storage(dir, e))?;
        Ok(Store {
            dir: dir.to_path_buf(),
            name: name.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{STATE_EXT}", self.name))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{LOCK_EXT}", self.name))
    }

    pub fn read(&self) -> Result<PoolState, PoolError> {
        let path = self.state_path();
        let data = std::fs::read(&path).map_err(|e| PoolError::storage(&path, e))?;
        serde_json::from_slice(&data).map_err(|e| PoolError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Writes the whole state to a sibling temp file and renames it over the
    /// old one, so a crash never leaves a half-written pool behind.
    pub fn write(&self, state: &PoolState) -> Result<(), PoolError> {
        let path = self.state_path();
        let data = serde_json::to_vec(state).map_err(|e| PoolError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| PoolError::storage(&self.dir, e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| PoolError::storage(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| PoolError::storage(&path, e.error))?;
        debug!("saved pool {} to {}", self.name, path.display());
        Ok(())
    }
}

pub trait FileLockExt {
    fn new_lock(&self) -> Result<Flock<File>, PoolError>;
}

impl FileLockExt for Store {
    /// Blocks until this process holds the network's exclusive lock. The
    /// lock is released when the returned `Flock` is dropped, or by the
    /// kernel if the process dies.
    fn new_lock(&self) -> Result<Flock<File>, PoolError> {
        let lock_file = self.lock_path();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_file)
            .map_err(|e| PoolError::storage(&lock_file, e))?;

        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_file, errno)| PoolError::storage(&lock_file, errno.into()))
    }
}
