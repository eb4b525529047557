//! The transaction manager (§4.6.1, §4.6.3–§4.6.5): begin/commit/abort
//! and startup recovery, plus the compound-hoisting wrapper that lets
//! list/hash operations run outside an explicit transaction (§4.6.2).

use crate::overlay::TransactionOverlay;
use crate::paths;
use crate::state::{KeyState, PendingTask, Transaction};
use kvlayer_core::record::{RollbackEntry, TransactionHeader};
use kvlayer_core::{normalize, Engine, Error, Result};
use kvlayer_locks::{namespace, LockManager};
use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Opens a file, `fsync`s it, and swallows the error — some filesystems
/// (notably network mounts) reject directory fsync outright (§4.6.3
/// step 4).
async fn fsync_dir(dir: &Path) {
    if let Ok(f) = fs::File::open(dir).await {
        let _ = f.sync_all().await;
    }
}

/// Owns the transaction directory (`<trans_dir>/logs`, `<trans_dir>/data`)
/// and the PID file gating recovery at startup.
pub struct TransactionManager {
    engine: Arc<dyn Engine>,
    locks: Arc<LockManager>,
    trans_dir: std::path::PathBuf,
}

impl TransactionManager {
    pub fn new(engine: Arc<dyn Engine>, locks: Arc<LockManager>, trans_dir: std::path::PathBuf) -> Self {
        TransactionManager { engine, locks, trans_dir }
    }

    fn pid_path(&self) -> std::path::PathBuf {
        self.trans_dir.join("kvlayer.pid")
    }

    /// Startup hook (§4.6.5): if a PID file from a prior run is present,
    /// recovery must run before anything else touches the transaction
    /// directory. Writes this process's own PID file afterward.
    pub async fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.trans_dir).await?;
        if fs::metadata(self.pid_path()).await.is_ok() {
            self.recover().await?;
        }
        fs::write(self.pid_path(), std::process::id().to_string()).await?;
        Ok(())
    }

    /// Clean-shutdown hook: removing the PID file tells the next startup
    /// that no recovery is needed.
    pub async fn shutdown(&self) -> Result<()> {
        fs::remove_file(self.pid_path()).await.ok();
        Ok(())
    }

    /// Replay every rollback log under `<trans_dir>/logs/` as an abort,
    /// then unconditionally clear `<trans_dir>/data/` (§4.6.5).
    pub async fn recover(&self) -> Result<()> {
        let logs_dir = paths::logs_dir(&self.trans_dir);
        fs::create_dir_all(&logs_dir).await?;
        let mut entries = fs::read_dir(&logs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Err(e) = self.replay_log(&path).await {
                warn!(path = %path.display(), error = %e, "failed to replay rollback log during recovery");
            }
        }
        let data_dir = paths::data_dir(&self.trans_dir);
        fs::create_dir_all(&data_dir).await?;
        let mut entries = fs::read_dir(&data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            fs::remove_file(entry.path()).await.ok();
        }
        Ok(())
    }

    /// Begin a transaction over `path` (§4.6.1): acquire `T|path` and
    /// hand back an overlay engine that routes reads/writes through
    /// in-memory key state and per-transaction scratch files.
    pub async fn begin(&self, path: &str) -> Result<TransactionOverlay> {
        let norm_path = normalize(path).to_string();
        let lock_key = namespace::transaction(&norm_path);
        // Held for the lifetime of the transaction, across begin/commit
        // or begin/abort, which outlives any single method call: forget
        // the guard here and release it explicitly in finish_abort /
        // finalize_commit.
        std::mem::forget(self.locks.lock(&lock_key).await);

        let id = Uuid::new_v4().to_string();
        let state = Arc::new(Mutex::new(Transaction::new(
            id,
            norm_path,
            now_epoch_secs(),
            std::process::id(),
        )));
        Ok(TransactionOverlay::new(self.engine.clone(), self.trans_dir.clone(), state))
    }

    /// Every list/hash/index operation is hoisted through this when run
    /// outside an explicit transaction (§4.6.2): begin on `path`, run
    /// `f` against the overlay, commit, and surface its queued
    /// post-commit tasks. Commit failure triggers an automatic abort;
    /// an abort failure at that point is fatal.
    pub async fn with_transaction<F, Fut, T>(&self, path: &str, f: F) -> Result<(T, Vec<PendingTask>)>
    where
        F: FnOnce(Arc<dyn Engine>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let overlay = Arc::new(self.begin(path).await?);
        let engine_handle: Arc<dyn Engine> = overlay.clone();
        match f(engine_handle).await {
            Ok(value) => match self.commit(&overlay).await {
                Ok(tasks) => Ok((value, tasks)),
                Err(commit_err) => {
                    if let Err(abort_err) = self.abort(&overlay).await {
                        return Err(Error::Fatal(format!(
                            "abort failed after commit error ({commit_err}): {abort_err}"
                        )));
                    }
                    Err(commit_err)
                }
            },
            Err(op_err) => {
                if let Err(abort_err) = self.abort(&overlay).await {
                    return Err(Error::Fatal(format!(
                        "abort failed after operation error ({op_err}): {abort_err}"
                    )));
                }
                Err(op_err)
            }
        }
    }

    /// Commit under `C|path` (§4.6.3). Returns the transaction's queued
    /// post-commit tasks on success.
    pub async fn commit(&self, overlay: &TransactionOverlay) -> Result<Vec<PendingTask>> {
        let state = overlay.state_handle();
        let (id, path, pid, date, keys) = {
            let mut t = state.lock();
            if !t.begin_committing() {
                return Err(Error::Conflict(format!("transaction {} is already completing", t.id)));
            }
            (t.id.clone(), t.path.clone(), t.pid, t.date, t.keys.clone())
        };

        let commit_key = namespace::commit(&path);
        let _commit_guard = self.locks.lock(&commit_key).await;

        let logs_dir = paths::logs_dir(&self.trans_dir);
        fs::create_dir_all(&logs_dir).await?;
        let log_path = paths::log_path(&self.trans_dir, &id);

        // Steps 1-4: build the rollback log. Any failure here aborts;
        // nothing has touched the engine yet.
        if let Err(e) = self.write_rollback_log(&log_path, &id, &path, date, pid, &keys).await {
            fs::remove_file(&log_path).await.ok();
            self.finish_abort(&id, &path).await?;
            return Err(e);
        }

        // Steps 5-7: apply writes/deletes. Any failure past this point is
        // fatal (§7) — the rollback log no longer reflects reality.
        match self.apply_commit(&id, &keys).await {
            Ok(()) => {
                fsync_dir(&paths::data_dir(&self.trans_dir)).await;
                fs::remove_file(&log_path).await.ok();
                self.cleanup_transaction_files(&id).await;
                self.locks.unlock(&namespace::transaction(&path));
                let tasks = state.lock().take_queue();
                Ok(tasks)
            }
            Err(e) => Err(Error::Fatal(format!(
                "commit of transaction {id} failed while applying writes: {e}"
            ))),
        }
    }

    async fn write_rollback_log(
        &self,
        log_path: &Path,
        id: &str,
        path: &str,
        date: i64,
        pid: u32,
        keys: &std::collections::BTreeMap<String, KeyState>,
    ) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(log_path)
            .await?;

        let header = TransactionHeader {
            id: id.to_string(),
            path: path.to_string(),
            date,
            pid,
        };
        let header_line = serde_json::to_string(&header).expect("TransactionHeader always serializes");
        file.write_all(header_line.as_bytes()).await?;
        file.write_all(b"\n").await?;

        for key in keys.keys() {
            let pre_image = match self.engine.get(key).await {
                Ok((bytes, _)) => Some(serde_json::from_slice(&bytes).map_err(|e| {
                    Error::ParseError(format!("corrupt pre-image for '{key}': {e}"))
                })?),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            let entry = RollbackEntry {
                key: key.clone(),
                value: pre_image,
            };
            let entry_line = serde_json::to_string(&entry).expect("RollbackEntry always serializes");
            file.write_all(entry_line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }

        file.sync_all().await?;
        drop(file);
        fsync_dir(&paths::logs_dir(&self.trans_dir)).await;
        Ok(())
    }

    async fn apply_commit(&self, id: &str, keys: &std::collections::BTreeMap<String, KeyState>) -> Result<()> {
        for (key, key_state) in keys {
            match key_state {
                KeyState::Written => {
                    let tmp_path = paths::scratch_path(&self.trans_dir, id, key);
                    let fast_path = self.engine.commit_temp_file(key, &tmp_path).await?;
                    if !fast_path {
                        let bytes = fs::read(&tmp_path).await?;
                        self.engine.put(key, &bytes).await?;
                        fs::remove_file(&tmp_path).await.ok();
                    }
                }
                KeyState::Deleted => match self.engine.delete(key).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Abort (§4.6.4): reverse whatever rollback log exists for this
    /// transaction, then discard its scratch files and release its
    /// locks. Idempotent — a transaction already committing or aborting
    /// is left alone.
    pub async fn abort(&self, overlay: &TransactionOverlay) -> Result<()> {
        let state = overlay.state_handle();
        let (id, path) = {
            let mut t = state.lock();
            if !t.begin_aborting() {
                return Ok(());
            }
            (t.id.clone(), t.path.clone())
        };
        self.finish_abort(&id, &path).await
    }

    async fn finish_abort(&self, id: &str, path: &str) -> Result<()> {
        let log_path = paths::log_path(&self.trans_dir, id);
        if fs::metadata(&log_path).await.is_ok() {
            self.replay_log(&log_path).await?;
        }
        self.cleanup_transaction_files(id).await;
        self.locks.unlock(&namespace::transaction(path));
        Ok(())
    }

    /// Reverse a rollback log: `put` back every present pre-image,
    /// `delete` every absent one (tolerating `NoSuchKey`), then remove
    /// the log. Shared by `abort` and startup `recover`.
    async fn replay_log(&self, log_path: &Path) -> Result<()> {
        let text = fs::read_to_string(log_path).await?;
        let mut lines = text.lines();
        let header_line = lines
            .next()
            .ok_or_else(|| Error::EngineError(format!("empty rollback log {}", log_path.display())))?;
        let _header: TransactionHeader = serde_json::from_str(header_line)
            .map_err(|e| Error::ParseError(format!("corrupt rollback log header in {}: {e}", log_path.display())))?;

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let entry: RollbackEntry = serde_json::from_str(line).map_err(|e| {
                Error::ParseError(format!("corrupt rollback log entry in {}: {e}", log_path.display()))
            })?;
            match entry.value {
                Some(value) => {
                    let bytes = serde_json::to_vec(&value).expect("JSON value always serializes");
                    self.engine.put(&entry.key, &bytes).await?;
                }
                None => match self.engine.delete(&entry.key).await {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        fs::remove_file(log_path).await.ok();
        Ok(())
    }

    /// Remove every per-transaction scratch file `<id>-<md5(key)>.json`
    /// under `<trans_dir>/data/`.
    async fn cleanup_transaction_files(&self, id: &str) {
        let data_dir = paths::data_dir(&self.trans_dir);
        let prefix = format!("{id}-");
        if let Ok(mut entries) = fs::read_dir(&data_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    fs::remove_file(entry.path()).await.ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_engine::MemoryEngine;
    use kvlayer_locks::LockManager;

    fn manager(engine: Arc<dyn Engine>) -> (TransactionManager, tempfile::TempDir) {
        let locks = Arc::new(LockManager::new());
        let dir = tempfile::tempdir().unwrap();
        let mgr = TransactionManager::new(engine, locks, dir.path().to_path_buf());
        (mgr, dir)
    }

    #[tokio::test]
    async fn commit_applies_writes_and_deletes() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        engine.put("trans1/c", br#"{"v":"pre-existing"}"#).await.unwrap();
        let (mgr, _dir) = manager(engine.clone());

        let overlay = mgr.begin("trans1").await.unwrap();
        overlay.put("trans1/a", br#"{"v":1}"#).await.unwrap();
        overlay.put("trans1/b", br#"{"v":2}"#).await.unwrap();
        overlay.delete("trans1/c").await.unwrap();

        // Not yet visible outside the transaction.
        assert!(engine.get("trans1/a").await.is_err());
        assert!(engine.get("trans1/c").await.is_ok());

        let tasks = mgr.commit(&overlay).await.unwrap();
        assert!(tasks.is_empty());

        assert_eq!(engine.get("trans1/a").await.unwrap().0, br#"{"v":1}"#);
        assert_eq!(engine.get("trans1/b").await.unwrap().0, br#"{"v":2}"#);
        assert!(engine.get("trans1/c").await.is_err());
    }

    #[tokio::test]
    async fn abort_leaves_engine_untouched() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        engine.put("trans1/c", br#"{"v":"pre-existing"}"#).await.unwrap();
        let (mgr, _dir) = manager(engine.clone());

        let overlay = mgr.begin("trans1").await.unwrap();
        overlay.put("trans1/a", br#"{"v":1}"#).await.unwrap();
        overlay.delete("trans1/c").await.unwrap();
        mgr.abort(&overlay).await.unwrap();

        assert!(engine.get("trans1/a").await.is_err());
        assert_eq!(engine.get("trans1/c").await.unwrap().0, br#"{"v":"pre-existing"}"#);
    }

    #[tokio::test]
    async fn delete_requires_existing_record() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let (mgr, _dir) = manager(engine.clone());
        let overlay = mgr.begin("trans1").await.unwrap();
        assert!(overlay.delete("trans1/missing").await.is_err());
    }

    #[tokio::test]
    async fn written_key_reads_back_from_overlay() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let (mgr, _dir) = manager(engine.clone());
        let overlay = mgr.begin("trans1").await.unwrap();
        overlay.put("trans1/a", br#"{"v":1}"#).await.unwrap();
        let (bytes, _) = overlay.get("trans1/a").await.unwrap();
        assert_eq!(bytes, br#"{"v":1}"#);
    }

    #[tokio::test]
    async fn with_transaction_auto_commits_on_success() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let (mgr, _dir) = manager(engine.clone());
        let (value, tasks) = mgr
            .with_transaction("trans1", |overlay| async move {
                overlay.put("trans1/a", br#"{"v":1}"#).await?;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(tasks.is_empty());
        assert_eq!(engine.get("trans1/a").await.unwrap().0, br#"{"v":1}"#);
    }

    #[tokio::test]
    async fn with_transaction_aborts_on_operation_failure() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let (mgr, _dir) = manager(engine.clone());
        let result = mgr
            .with_transaction("trans1", |overlay| async move {
                overlay.put("trans1/a", br#"{"v":1}"#).await?;
                Err::<(), _>(Error::InvalidInput("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(engine.get("trans1/a").await.is_err());
    }

    #[tokio::test]
    async fn recovery_replays_leftover_rollback_log() {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let (mgr, _dir) = manager(engine.clone());

        let overlay = mgr.begin("trans1").await.unwrap();
        overlay.put("trans1/a", br#"{"v":1}"#).await.unwrap();
        let id = overlay.id();

        // Simulate a crash after the rollback log was fully written
        // (§4.6.3 step 4) but before any writes were applied.
        let header = TransactionHeader {
            id: id.clone(),
            path: "trans1".into(),
            date: 0,
            pid: std::process::id(),
        };
        let entry = RollbackEntry {
            key: "trans1/a".into(),
            value: None,
        };
        let log_path = paths::log_path(&mgr.trans_dir, &id);
        fs::create_dir_all(log_path.parent().unwrap()).await.unwrap();
        let contents = format!(
            "{}\n{}\n",
            serde_json::to_string(&header).unwrap(),
            serde_json::to_string(&entry).unwrap()
        );
        fs::write(&log_path, contents).await.unwrap();

        mgr.recover().await.unwrap();

        assert!(engine.get("trans1/a").await.is_err());
        assert!(fs::metadata(&log_path).await.is_err());
    }
}
