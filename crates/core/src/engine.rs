//! The byte-level Engine interface (§6.1).
//!
//! Every backing store — filesystem, S3, Redis, Couchbase, MongoDB,
//! SQLite — implements this trait. The rest of the workspace never talks
//! to a backing store except through it, so swapping engines never
//! touches the list/hash/index/transaction layers.

use crate::error::Result;
use async_trait::async_trait;
use bytes_stream::ByteStream;

/// Point-in-time metadata about a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    /// Last-modified time, in epoch seconds.
    pub modified: i64,
    /// Length of the stored value in bytes.
    pub length: u64,
}

/// The byte-level key/value engine interface every backing store
/// implements (§6.1).
///
/// `key` arguments are always already-normalized strings (§3.1); engines
/// never see raw, un-normalized keys. A `NotFound` result must always be
/// surfaced as [`crate::error::Error::NotFound`] carrying the `NoSuchKey`
/// code, regardless of the engine's native missing-key representation.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Store `value` at `key`, overwriting any existing value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Store a stream of bytes at `key`. Required for binary keys whose
    /// value is too large to buffer in memory.
    async fn put_stream(&self, key: &str, stream: ByteStream) -> Result<()>;

    /// Fetch the value and metadata for `key`.
    async fn get(&self, key: &str) -> Result<(Vec<u8>, RecordInfo)>;

    /// Fetch only metadata for `key`, without reading the value.
    async fn head(&self, key: &str) -> Result<RecordInfo>;

    /// Fetch a byte range `[start, end)` of the value at `key`, along
    /// with metadata for the whole object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<(Vec<u8>, RecordInfo)>;

    /// Remove `key`. Returns `NotFound` if it did not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Run engine-specific periodic maintenance (e.g. compaction,
    /// checkpointing). Called once per day by the Store's daily
    /// maintenance pass (§4.2).
    async fn run_maintenance(&self) -> Result<()> {
        Ok(())
    }

    /// Optional fast path used only by transaction commit (§4.6.3 step
    /// 5): move a per-transaction scratch file directly into place
    /// instead of read+put. Filesystem engines implement this as a
    /// rename; others fall back to the default (read the temp file,
    /// `put`, then remove it), which the transaction layer does itself
    /// when this returns `Ok(false)`.
    async fn commit_temp_file(&self, _key: &str, _tmp_path: &std::path::Path) -> Result<bool> {
        Ok(false)
    }

    /// Optional bounded-parallel multi-put. The default implementation
    /// reports that no native batch primitive is available so the Store
    /// fans out `put` calls itself (§4.2).
    async fn put_multi(&self, _items: &[(String, Vec<u8>)]) -> Result<Option<()>> {
        Ok(None)
    }

    /// Release any resources the engine holds (connections, file
    /// handles). Called once by the Store's `shutdown`, after its queue
    /// has drained and all locks have released.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// A tiny owned byte-stream abstraction, standing in for the source
/// system's readable stream. Kept minimal since the core spec's list,
/// hash, index, and transaction layers only ever deal in whole JSON
/// values; only binary-key `putStream` needs it.
pub mod bytes_stream {
    use futures_core::stream::BoxStream;

    /// A boxed stream of byte chunks.
    pub type ByteStream = BoxStream<'static, std::io::Result<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_object_safe(_: &dyn Engine) {}

    struct Noop;

    #[async_trait]
    impl Engine for Noop {
        async fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn put_stream(&self, _key: &str, _stream: bytes_stream::ByteStream) -> Result<()> {
            Ok(())
        }
        async fn get(&self, key: &str) -> Result<(Vec<u8>, RecordInfo)> {
            Err(crate::error::Error::not_found(key))
        }
        async fn head(&self, key: &str) -> Result<RecordInfo> {
            Err(crate::error::Error::not_found(key))
        }
        async fn get_range(&self, key: &str, _s: u64, _e: u64) -> Result<(Vec<u8>, RecordInfo)> {
            Err(crate::error::Error::not_found(key))
        }
        async fn delete(&self, key: &str) -> Result<()> {
            Err(crate::error::Error::not_found(key))
        }
    }

    #[test]
    fn engine_is_object_safe() {
        let noop = Noop;
        assert_object_safe(&noop);
    }
}
