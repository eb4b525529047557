//! An in-memory `Engine`, used by every other crate's test suite and by
//! hosts that want to embed kvlayer without a backing store (§C of
//! SPEC_FULL.md — the teacher repo ships comparable in-memory test
//! scaffolding alongside its production store).

use async_trait::async_trait;
use dashmap::DashMap;
use kvlayer_core::engine::bytes_stream::ByteStream;
use kvlayer_core::{Engine, Error, RecordInfo, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_stream::StreamExt;

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    info: RecordInfo,
}

/// A backing store that keeps every record in a `DashMap`. Not durable
/// across process restarts; intended for tests and for hosts that accept
/// in-process-only persistence.
pub struct MemoryEngine {
    data: DashMap<String, Entry>,
    clock: AtomicI64,
    maintenance_runs: Mutex<u64>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine {
            data: DashMap::new(),
            clock: AtomicI64::new(0),
            maintenance_runs: Mutex::new(0),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of times `run_maintenance` has been called. Exposed for
    /// tests that assert the Store's daily maintenance pass reaches the
    /// engine hook (§4.2's `runMaintenance`).
    pub fn maintenance_runs(&self) -> u64 {
        *self.maintenance_runs.lock()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let info = RecordInfo {
            modified: self.tick(),
            length: value.len() as u64,
        };
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                info,
            },
        );
        Ok(())
    }

    async fn put_stream(&self, key: &str, mut stream: ByteStream) -> Result<()> {
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.put(key, &buf).await
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, RecordInfo)> {
        self.data
            .get(key)
            .map(|e| (e.value.clone(), e.info))
            .ok_or_else(|| Error::not_found(key))
    }

    async fn head(&self, key: &str) -> Result<RecordInfo> {
        self.data
            .get(key)
            .map(|e| e.info)
            .ok_or_else(|| Error::not_found(key))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<(Vec<u8>, RecordInfo)> {
        let entry = self
            .data
            .get(key)
            .ok_or_else(|| Error::not_found(key))?;
        let len = entry.value.len() as u64;
        if start > end || end > len {
            return Err(Error::InvalidInput(format!(
                "range [{start}, {end}) out of bounds for '{key}' (len {len})"
            )));
        }
        Ok((
            entry.value[start as usize..end as usize].to_vec(),
            entry.info,
        ))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(key))
    }

    async fn run_maintenance(&self) -> Result<()> {
        *self.maintenance_runs.lock() += 1;
        Ok(())
    }

    async fn commit_temp_file(&self, key: &str, tmp_path: &std::path::Path) -> Result<bool> {
        let bytes = tokio::fs::read(tmp_path).await?;
        self.put(key, &bytes).await?;
        Ok(true)
    }
}

/// Wrap a `MemoryEngine` for sharing across the Store, lock manager, and
/// transaction layer.
pub fn shared() -> Arc<MemoryEngine> {
    Arc::new(MemoryEngine::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let e = MemoryEngine::new();
        e.put("a", b"hello").await.unwrap();
        let (v, info) = e.get("a").await.unwrap();
        assert_eq!(v, b"hello");
        assert_eq!(info.length, 5);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let e = MemoryEngine::new();
        let err = e.get("missing").await.unwrap_err();
        assert_eq!(err.code(), "NoSuchKey");
    }

    #[tokio::test]
    async fn range_out_of_bounds_rejected() {
        let e = MemoryEngine::new();
        e.put("a", b"hello").await.unwrap();
        assert!(e.get_range("a", 0, 100).await.is_err());
        let (v, _) = e.get_range("a", 1, 3).await.unwrap();
        assert_eq!(v, b"el");
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let e = MemoryEngine::new();
        assert!(e.delete("nope").await.unwrap_err().is_not_found());
    }
}
