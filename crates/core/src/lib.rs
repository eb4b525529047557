//! Shared types for kvlayer: key normalization, the value model, the
//! unified error type, the `Engine` trait every backing store
//! implements, and the semantic record shapes (list/hash/transaction)
//! the container crates build on.

pub mod engine;
pub mod error;
pub mod key;
pub mod record;
pub mod value;

pub use engine::{Engine, RecordInfo};
pub use error::{Error, Result};
pub use key::{normalize, NormalizedKey};
pub use value::Value;

/// Compute the lower-case hex MD5 digest of `s`, used for hash-routing
/// (§3.4) and rollback-log file names (§6.3).
pub fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}
