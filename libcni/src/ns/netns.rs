use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;

/// An open handle on a network namespace file.
#[derive(Debug)]
pub struct Netns {
    f: File,
    path: PathBuf,
}

impl Netns {
    /// Opens the namespace at `path`, returning `Ok(None)` if it is gone.
    pub fn get_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        match OpenOptions::new().read(true).open(path) {
            Ok(f) => Ok(Some(Self {
                f,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::anyhow!(
                "failed to open netns {}: {}",
                path.display(),
                e
            )),
        }
    }

    /// The namespace of the calling thread.
    pub fn get() -> anyhow::Result<Self> {
        let path = PathBuf::from(format!(
            "/proc/{}/task/{}/ns/net",
            std::process::id(),
            nix::unistd::gettid()
        ));
        let f = OpenOptions::new().read(true).open(&path)?;
        Ok(Self { f, path })
    }

    pub fn try_clone(&self) -> anyhow::Result<Self> {
        Ok(Self {
            f: self.f.try_clone()?,
            path: self.path.clone(),
        })
    }

    /// Switches the calling thread into this namespace.
    pub fn set(&self) -> anyhow::Result<()> {
        nix::sched::setns(self.f.as_fd(), CloneFlags::CLONE_NEWNET).map_err(anyhow::Error::from)
    }

    /// Device and inode of the namespace file, stable for its lifetime.
    pub fn unique_id(&self) -> String {
        match self.f.metadata() {
            Err(_) => "NS(unknown)".into(),
            Ok(metadata) => format!("NS({}:{})", metadata.dev(), metadata.ino()),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.f.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Runs `exec` with the calling thread switched into `target_ns`, then
/// switches back to `cur_ns` whether or not `exec` succeeded.
///
/// Only sound on a current-thread runtime: the future must not migrate to
/// another thread while it is being polled.
pub async fn exec_netns<T, F>(cur_ns: &Netns, target_ns: &Netns, exec: F) -> anyhow::Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    target_ns.set()?;
    let result = exec.await;
    cur_ns.set()?;
    result
}

impl PartialEq<Self> for Netns {
    fn eq(&self, other: &Self) -> bool {
        match (self.f.metadata(), other.f.metadata()) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }
}

impl Display for Netns {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.unique_id(), self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_namespace_equals_itself() {
        let a = Netns::get().unwrap();
        let b = Netns::get_from_path(Path::new("/proc/self/ns/net"))
            .unwrap()
            .expect("own netns is always present");
        assert_eq!(a, b);
        assert_eq!(a.unique_id(), a.try_clone().unwrap().unique_id());
    }

    #[test]
    fn test_missing_namespace() {
        let ns = Netns::get_from_path(Path::new("/var/run/netns/definitely-not-here")).unwrap();
        assert!(ns.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    #[ignore = "setns needs CAP_SYS_ADMIN"]
    async fn test_exec_in_same_namespace() {
        let cur = Netns::get().unwrap();
        let target = cur.try_clone().unwrap();
        let seen = exec_netns(&cur, &target, async { Netns::get() })
            .await
            .unwrap();
        assert_eq!(seen, cur);
    }
}
