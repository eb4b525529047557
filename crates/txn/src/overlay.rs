//! `TransactionOverlay` (§4.6.1): an `Engine` itself, so every list/hash/
//! index operation can run unmodified against a transaction without
//! knowing it's inside one.

use crate::paths::scratch_path;
use crate::state::{KeyState, Transaction};
use async_trait::async_trait;
use kvlayer_core::engine::bytes_stream::ByteStream;
use kvlayer_core::key::normalize;
use kvlayer_core::{Engine, Error, RecordInfo, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// A derived Store-facing engine whose writes land in per-transaction
/// scratch files instead of the underlying engine, and whose reads
/// consult the transaction's in-memory key state first (§4.6.1).
pub struct TransactionOverlay {
    engine: Arc<dyn Engine>,
    trans_dir: PathBuf,
    state: Arc<Mutex<Transaction>>,
    tmp_counter: AtomicU64,
}

impl TransactionOverlay {
    pub(crate) fn new(engine: Arc<dyn Engine>, trans_dir: PathBuf, state: Arc<Mutex<Transaction>>) -> Self {
        TransactionOverlay {
            engine,
            trans_dir,
            state,
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    pub fn path(&self) -> String {
        self.state.lock().path.clone()
    }

    pub(crate) fn state_handle(&self) -> Arc<Mutex<Transaction>> {
        self.state.clone()
    }

    fn scratch_path_for(&self, key: &str) -> PathBuf {
        scratch_path(&self.trans_dir, &self.id(), key)
    }

    /// Binary keys bypass transactions entirely (§4.6.1): their records
    /// aren't subject to copy-on-write overlay or rollback-log coverage.
    fn is_binary_key(key: &str) -> bool {
        normalize(key).is_binary()
    }

    async fn write_scratch(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let n = self.tmp_counter.fetch_add(1, Ordering::SeqCst);
        let tmp = path.with_extension(format!("tmp.{n}"));
        {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(bytes).await?;
            f.sync_all().await?;
        }
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_scratch(&self, key: &str) -> Result<(Vec<u8>, RecordInfo)> {
        let path = self.scratch_path_for(key);
        let bytes = fs::read(&path).await.map_err(|_| Error::not_found(key))?;
        let meta = fs::metadata(&path).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok((
            bytes.clone(),
            RecordInfo {
                modified,
                length: bytes.len() as u64,
            },
        ))
    }
}

#[async_trait]
impl Engine for TransactionOverlay {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if Self::is_binary_key(key) {
            return self.engine.put(key, value).await;
        }
        let path = self.scratch_path_for(key);
        self.write_scratch(&path, value).await?;
        self.state.lock().mark_written(key);
        Ok(())
    }

    /// Binary keys bypass transactions entirely (§4.6.1): their
    /// `putStream` writes pass straight through to the underlying
    /// engine.
    async fn put_stream(&self, key: &str, stream: ByteStream) -> Result<()> {
        self.engine.put_stream(key, stream).await
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, RecordInfo)> {
        if Self::is_binary_key(key) {
            return self.engine.get(key).await;
        }
        let state = self.state.lock().state_of(key);
        match state {
            Some(KeyState::Deleted) => Err(Error::not_found(key)),
            Some(KeyState::Written) => self.read_scratch(key).await,
            None => self.engine.get(key).await,
        }
    }

    async fn head(&self, key: &str) -> Result<RecordInfo> {
        if Self::is_binary_key(key) {
            return self.engine.head(key).await;
        }
        let state = self.state.lock().state_of(key);
        match state {
            Some(KeyState::Deleted) => Err(Error::not_found(key)),
            Some(KeyState::Written) => self.read_scratch(key).await.map(|(_, info)| info),
            None => self.engine.head(key).await,
        }
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<(Vec<u8>, RecordInfo)> {
        if Self::is_binary_key(key) {
            return self.engine.get_range(key, start, end).await;
        }
        let (bytes, info) = self.get(key).await?;
        if start > end || end > info.length {
            return Err(Error::InvalidInput(format!(
                "range [{start}, {end}) out of bounds for '{key}' (len {})",
                info.length
            )));
        }
        Ok((bytes[start as usize..end as usize].to_vec(), info))
    }

    /// Deletes require the record to exist at the start of the
    /// transaction, verified via the underlying engine's `head`
    /// (§4.6.1).
    async fn delete(&self, key: &str) -> Result<()> {
        if Self::is_binary_key(key) {
            return self.engine.delete(key).await;
        }
        let state = self.state.lock().state_of(key);
        match state {
            Some(KeyState::Deleted) => return Err(Error::not_found(key)),
            Some(KeyState::Written) => {}
            None => {
                self.engine.head(key).await?;
            }
        }
        let path = self.scratch_path_for(key);
        fs::remove_file(&path).await.ok();
        self.state.lock().mark_deleted(key);
        Ok(())
    }
}
