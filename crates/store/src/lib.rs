//! The Store facade (§4.2): key normalization dispatch, an in-process
//! RAM cache, a bounded background task queue, expiration bookkeeping,
//! and daily maintenance, composed over one shared engine, lock
//! manager, list container, and hash container.

pub mod cache;
pub mod config;
pub mod expire;
pub mod queue;
pub mod stats;
pub mod store;

pub use config::StoreConfig;
pub use queue::{BoxedEffect, Task};
pub use stats::Stats;
pub use store::Store;
