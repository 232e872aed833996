use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    #[error("pool storage {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pool state {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("no addresses available in pool {0}")]
    Exhausted(String),

    #[error("address {address} is not allocated in pool {pool}")]
    NotAllocated { pool: String, address: Ipv4Addr },

    #[error("{owner} already holds {address} in pool {pool}")]
    AlreadyAllocated {
        pool: String,
        owner: String,
        address: Ipv4Addr,
    },
}

impl PoolError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// True when the state file simply does not exist yet.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Storage { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}
