//! The paged list container (§4.3, §3.3): an ordered sequence spread
//! across fixed-size leaf pages plus a header, supporting push, unshift,
//! pop, shift, splice, find, and each while preserving the invariant
//! that every internal page holds exactly `page_size` items.

pub mod criteria;
pub mod store;

pub use criteria::{Criteria, Criterion};
pub use store::{ItemUpdate, ListStore, DEFAULT_PAGE_SIZE};
