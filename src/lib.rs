//! The top-level `Database` facade (§9): composition over inheritance.
//! One engine and one lock manager, shared by the Store (plain records,
//! lists, hashes), the indexer, and the transaction manager — the
//! source system's mixin-composed object restated as a Rust struct
//! holding its collaborators rather than inheriting from them.

use kvlayer_core::{Engine, Result};
use kvlayer_hash::HashStore;
use kvlayer_index::{IndexConfig, Indexer, Query};
use kvlayer_locks::LockManager;
use kvlayer_txn::{PendingTask, TransactionManager, TransactionOverlay};
use std::path::PathBuf;
use std::sync::Arc;

pub use kvlayer_core::Value;
pub use kvlayer_store::{Stats, Store, StoreConfig, Task};

fn bridge_task(task: PendingTask) -> Task {
    match task {
        PendingTask::ExpireSet { key, expiration } => Task::ExpireSet { key, expiration },
    }
}

/// The embeddable database: plain records, paged lists and hashes, a
/// full-text/structured indexer, and crash-safe transactions, all
/// sharing one backing [`Engine`].
pub struct Database {
    store: Store,
    indexer: Indexer,
    transactions: TransactionManager,
    locks: Arc<LockManager>,
}

impl Database {
    /// Open a database over `engine`, running startup recovery on
    /// `trans_dir` before returning (§4.6.5).
    pub async fn open(engine: Arc<dyn Engine>, config: StoreConfig, trans_dir: PathBuf) -> Result<Self> {
        let locks = Arc::new(LockManager::new());
        let store = Store::with_locks(engine.clone(), locks.clone(), config);
        let indexer = Indexer::new(engine.clone(), HashStore::new(engine.clone(), locks.clone()));
        let transactions = TransactionManager::new(engine, locks.clone(), trans_dir);
        transactions.start().await?;
        Ok(Database {
            store,
            indexer,
            transactions,
            locks,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Begin an explicit transaction over `path` (§4.6.1). Hosts that
    /// want to group several writes atomically use this directly,
    /// running their own list/hash/indexer calls against an engine
    /// built over the returned overlay; `commit`/`abort` below finish
    /// it off and (on commit) forward its queued tasks to the Store's
    /// background queue.
    pub async fn begin(&self, path: &str) -> Result<TransactionOverlay> {
        self.transactions.begin(path).await
    }

    pub async fn commit(&self, overlay: &TransactionOverlay) -> Result<()> {
        let tasks = self.transactions.commit(overlay).await?;
        for task in tasks {
            self.store.enqueue(bridge_task(task)).await;
        }
        Ok(())
    }

    pub async fn abort(&self, overlay: &TransactionOverlay) -> Result<()> {
        self.transactions.abort(overlay).await
    }

    /// Index `record` under `config` (§4.5.4), compound-hoisted into an
    /// implicit transaction on `config.base_path` when not already
    /// inside one (§4.6.2).
    pub async fn index_record(&self, config: &IndexConfig, record: &serde_json::Value) -> Result<()> {
        let locks = self.locks.clone();
        let cfg = config.clone();
        let record = record.clone();
        let (_, tasks) = self
            .transactions
            .with_transaction(&config.base_path, move |overlay: Arc<dyn Engine>| {
                let hash = HashStore::new(overlay.clone(), locks);
                let indexer = Indexer::new(overlay, hash);
                async move { indexer.index_record(&cfg, &record).await }
            })
            .await?;
        for task in tasks {
            self.store.enqueue(bridge_task(task)).await;
        }
        Ok(())
    }

    /// Remove a previously indexed record (§4.5.4), compound-hoisted
    /// the same way as `index_record`.
    pub async fn remove_record(&self, config: &IndexConfig, record_id: &str) -> Result<()> {
        let locks = self.locks.clone();
        let cfg = config.clone();
        let record_id = record_id.to_string();
        let (_, tasks) = self
            .transactions
            .with_transaction(&config.base_path, move |overlay: Arc<dyn Engine>| {
                let hash = HashStore::new(overlay.clone(), locks);
                let indexer = Indexer::new(overlay, hash);
                async move { indexer.remove_record(&cfg, &record_id).await }
            })
            .await?;
        for task in tasks {
            self.store.enqueue(bridge_task(task)).await;
        }
        Ok(())
    }

    /// Evaluate `query` against the index (§4.5.5). Read-only, so it
    /// runs directly against the shared engine without a transaction.
    pub async fn search(&self, config: &IndexConfig, query: &Query) -> Result<Vec<String>> {
        self.indexer.search(config, query).await
    }

    /// Evaluate `query` against a single in-memory record without
    /// touching storage (§4.5.6).
    pub fn search_single(config: &IndexConfig, query: &Query, record: &serde_json::Value) -> Result<bool> {
        Indexer::search_single(config, query, record)
    }

    pub async fn sort_records(
        &self,
        config: &IndexConfig,
        ids: Vec<String>,
        sorter_id: &str,
        direction: i32,
    ) -> Result<Vec<String>> {
        self.indexer.sort_records(config, ids, sorter_id, direction).await
    }

    /// Drain the Store's queue and release all locks, then shut down
    /// both the engine and the transaction manager's PID file (§4.2,
    /// §4.6.5).
    pub async fn shutdown(&self) -> Result<()> {
        self.store.shutdown().await?;
        self.transactions.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_engine::MemoryEngine;
    use kvlayer_index::{parse_simple, FieldDef};
    use serde_json::json;

    async fn database() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            Arc::new(MemoryEngine::new()),
            StoreConfig::default(),
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        (db, dir)
    }

    fn books_config() -> IndexConfig {
        IndexConfig::new("books")
            .with_field(FieldDef::word("title", "/title"))
            .with_field(FieldDef::word("author", "/author"))
    }

    #[tokio::test]
    async fn index_record_then_search_finds_it() {
        let (db, _dir) = database().await;
        let cfg = books_config();
        db.index_record(&cfg, &json!({"id": "b1", "title": "Rust in Action", "author": "Tim"}))
            .await
            .unwrap();

        let query = parse_simple("rust", "title");
        let hits = db.search(&cfg, &query).await.unwrap();
        assert_eq!(hits, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn index_record_is_visible_outside_its_implicit_transaction() {
        let (db, _dir) = database().await;
        let cfg = books_config();
        db.index_record(&cfg, &json!({"id": "b1", "title": "Zero to Production", "author": "Luca"}))
            .await
            .unwrap();

        // The blob record lives at a plain engine key once committed.
        let blob_key = format!("{}/_data/b1", cfg.base_path);
        assert!(db.store().engine().get(&blob_key).await.is_ok());
    }

    #[tokio::test]
    async fn remove_record_drops_it_from_search() {
        let (db, _dir) = database().await;
        let cfg = books_config();
        db.index_record(&cfg, &json!({"id": "b1", "title": "Rust in Action", "author": "Tim"}))
            .await
            .unwrap();
        db.remove_record(&cfg, "b1").await.unwrap();

        let query = parse_simple("rust", "title");
        let hits = db.search(&cfg, &query).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn explicit_transaction_commits_plain_record_writes() {
        let (db, _dir) = database().await;
        let overlay = db.begin("trans1").await.unwrap();
        overlay.put("trans1/a", br#"{"v":1}"#).await.unwrap();
        assert!(db.store().engine().get("trans1/a").await.is_err());
        db.commit(&overlay).await.unwrap();
        assert_eq!(db.store().engine().get("trans1/a").await.unwrap().0, br#"{"v":1}"#);
    }

    #[tokio::test]
    async fn explicit_transaction_abort_leaves_engine_untouched() {
        let (db, _dir) = database().await;
        let overlay = db.begin("trans1").await.unwrap();
        overlay.put("trans1/a", br#"{"v":1}"#).await.unwrap();
        db.abort(&overlay).await.unwrap();
        assert!(db.store().engine().get("trans1/a").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_drains_and_clears_pid_file() {
        let (db, _dir) = database().await;
        db.shutdown().await.unwrap();
    }
}
