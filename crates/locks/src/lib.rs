//! The in-process advisory lock manager (§4.1): exclusive and
//! shared/reader locks with FIFO waiters, isolated into namespaces by
//! key prefix.

pub mod manager;
pub mod namespace;

pub use manager::{LockGuard, LockManager, Locked};
