//! Distributed Lock Manager (§4.2).

mod error;
mod lock;

pub use error::LockError;
pub use lock::{LockHandle, LockManager};
