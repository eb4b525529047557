//! The transaction layer (§3.6, §4.6): a copy-on-write `Engine` overlay,
//! a write-ahead rollback log giving atomic commit, and crash recovery
//! for a bounded sub-path.

pub mod manager;
pub mod overlay;
pub mod paths;
pub mod state;

pub use manager::TransactionManager;
pub use overlay::TransactionOverlay;
pub use state::{KeyState, PendingTask, Transaction};
