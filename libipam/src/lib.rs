//! Durable, reuse-biased IPv4 address pool.
//!
//! One pool exists per CNI network. Its full state lives in
//! `<dataDir>/<network>.json` and is re-read by every plugin invocation;
//! [`AddressPool::lock`] serializes invocations across processes with an
//! exclusive `flock` on `<dataDir>/<network>.lock`.

mod bitmap;
mod disk;
mod error;
mod pool;
mod range;

pub use bitmap::Bitmap;
pub use disk::{FileLockExt, Store};
pub use error::PoolError;
pub use pool::{AddressPool, PoolGuard, PoolState};
pub use range::AddressRange;
