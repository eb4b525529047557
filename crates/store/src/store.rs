//! The Store facade (§4.2): the single entry point a host embeds,
//! composing the list and hash containers, the RAM cache, the
//! background queue, and the lock manager over one shared engine.

use crate::cache::Cache;
use crate::config::StoreConfig;
use crate::expire::{cleanup_list_key, normalize_expiration, EXPIRES_HASH_KEY};
use crate::queue::{Queue, Task};
use crate::stats::{Counters, Stats};
use chrono::{Datelike, NaiveDate, Utc};
use kvlayer_core::record::{record_kind, RecordKind};
use kvlayer_core::{normalize, Engine, Error, RecordInfo, Result, Value};
use kvlayer_hash::HashStore;
use kvlayer_list::ListStore;
use kvlayer_locks::{namespace, LockGuard, LockManager};
use serde_json::{json, Value as Json};
use std::sync::Arc;

fn encode(value: &Value) -> Vec<u8> {
    match value {
        Value::Buffer(bytes) => bytes.clone(),
        Value::Json(json) => serde_json::to_vec(json).expect("serde_json::Value always serializes"),
    }
}

fn decode(bytes: Vec<u8>, is_binary: bool) -> Result<Value> {
    if is_binary {
        Ok(Value::Buffer(bytes))
    } else {
        let json: Json = serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("malformed JSON record: {e}")))?;
        Ok(Value::Json(json))
    }
}

/// The top-level Store: one engine, one lock manager, shared across the
/// list and hash containers (§9's composition-over-inheritance note).
pub struct Store {
    engine: Arc<dyn Engine>,
    locks: Arc<LockManager>,
    list: ListStore,
    hash: HashStore,
    cache: Cache,
    counters: Counters,
    queue: Queue,
    config: StoreConfig,
}

impl Store {
    pub fn new(engine: Arc<dyn Engine>, config: StoreConfig) -> Self {
        Store::with_locks(engine, Arc::new(LockManager::new()), config)
    }

    /// Like [`Store::new`], but shares an externally-owned lock manager
    /// instead of creating its own — used by the top-level composition
    /// that also hands the indexer and transaction manager the same
    /// `engine`/`locks` pair (§9).
    pub fn with_locks(engine: Arc<dyn Engine>, locks: Arc<LockManager>, config: StoreConfig) -> Self {
        let list = ListStore::new(engine.clone(), locks.clone());
        let hash = HashStore::new(engine.clone(), locks.clone());

        let handler_list = list.clone();
        let handler_hash = hash.clone();
        let expiration_updates = config.expiration_updates;
        let on_expire_set = Arc::new(move |key: String, expiration: i64| {
            let list = handler_list.clone();
            let hash = handler_hash.clone();
            let effect: crate::queue::BoxedEffect = Box::pin(async move {
                let list_key = cleanup_list_key(expiration);
                if let Err(e) = list.push(&list_key, vec![json!(key.clone())]).await {
                    tracing::warn!(error = %e, key, "failed to record key on cleanup list");
                }
                if expiration_updates {
                    let mut patch = serde_json::Map::new();
                    patch.insert("expires".to_string(), json!(expiration));
                    if let Err(e) = hash.update(EXPIRES_HASH_KEY, &key, patch).await {
                        tracing::warn!(error = %e, key, "failed to update expires summary hash");
                    }
                }
            });
            effect
        });
        let queue = Queue::spawn(config.queue_capacity, config.queue_timeout, on_expire_set);

        Store {
            engine,
            locks,
            list,
            hash,
            cache: Cache::new(config.cache_key_match.clone()),
            counters: Counters::default(),
            queue,
            config,
        }
    }

    /// The paged list container, sharing this Store's engine and locks.
    pub fn list(&self) -> &ListStore {
        &self.list
    }

    /// The paged hash container, sharing this Store's engine and locks.
    pub fn hash(&self) -> &HashStore {
        &self.hash
    }

    /// The underlying engine, for composition with sibling facades
    /// (indexer, transaction manager) that must share it.
    pub fn engine(&self) -> Arc<dyn Engine> {
        self.engine.clone()
    }

    /// The lock manager, for composition with sibling facades that must
    /// share it.
    pub fn locks(&self) -> Arc<LockManager> {
        self.locks.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        let normalized = normalize(key);
        value.check_key(&normalized)?;
        let bytes = encode(&value);
        self.engine.put(normalized.as_str(), &bytes).await?;
        self.counters.record_put();
        if let Value::Json(json) = &value {
            self.cache.put(normalized.as_str(), json);
        } else {
            self.cache.invalidate(normalized.as_str());
        }
        Ok(())
    }

    pub async fn put_stream(&self, key: &str, stream: kvlayer_core::engine::bytes_stream::ByteStream) -> Result<()> {
        let normalized = normalize(key);
        if !normalized.is_binary() {
            return Err(Error::InvalidInput(format!(
                "key '{normalized}' is a JSON key; put_stream requires a binary key"
            )));
        }
        self.engine.put_stream(normalized.as_str(), stream).await?;
        self.counters.record_put();
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Value> {
        let normalized = normalize(key);
        if !normalized.is_binary() {
            if let Some(cached) = self.cache.get(normalized.as_str()) {
                self.counters.record_cache_hit();
                self.counters.record_get();
                return Ok(Value::Json(cached));
            }
            self.counters.record_cache_miss();
        }
        let (bytes, _info) = self.engine.get(normalized.as_str()).await?;
        self.counters.record_get();
        let value = decode(bytes, normalized.is_binary())?;
        if let Value::Json(json) = &value {
            self.cache.put(normalized.as_str(), json);
        }
        Ok(value)
    }

    /// Like [`Store::get`], but requires a binary key and returns the
    /// raw bytes directly (§4.2's `getBuffer`).
    pub async fn get_buffer(&self, key: &str) -> Result<Vec<u8>> {
        let normalized = normalize(key);
        if !normalized.is_binary() {
            return Err(Error::InvalidInput(format!(
                "key '{normalized}' is a JSON key; get_buffer requires a binary key"
            )));
        }
        let (bytes, _info) = self.engine.get(normalized.as_str()).await?;
        self.counters.record_get();
        Ok(bytes)
    }

    /// A byte range `[start, end)` of a binary key's value (§4.2's
    /// `getStreamRange`, read eagerly since the engine boundary here
    /// deals in whole byte ranges rather than a true stream).
    pub async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let normalized = normalize(key);
        if !normalized.is_binary() {
            return Err(Error::InvalidInput(format!(
                "key '{normalized}' is a JSON key; get_range requires a binary key"
            )));
        }
        let (bytes, _info) = self.engine.get_range(normalized.as_str(), start, end).await?;
        Ok(bytes)
    }

    pub async fn head(&self, key: &str) -> Result<RecordInfo> {
        let normalized = normalize(key);
        let info = self.engine.head(normalized.as_str()).await?;
        self.counters.record_head();
        Ok(info)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let normalized = normalize(key);
        self.engine.delete(normalized.as_str()).await?;
        self.cache.invalidate(normalized.as_str());
        self.counters.record_delete();
        Ok(())
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let value = self.get(src).await?;
        self.put(dst, value).await
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.copy(src, dst).await?;
        self.delete(src).await
    }

    pub async fn put_multi(&self, items: Vec<(String, Value)>) -> Result<Vec<Result<()>>> {
        let mut prepared = Vec::with_capacity(items.len());
        for (key, value) in &items {
            let normalized = normalize(key);
            value.check_key(&normalized)?;
            prepared.push((normalized.to_string(), encode(value)));
        }
        if self.engine.put_multi(&prepared).await?.is_some() {
            for (key, value) in &items {
                if let Value::Json(json) = value {
                    self.cache.put(&normalize(key).to_string(), json);
                }
                self.counters.record_put();
            }
            return Ok(prepared.iter().map(|_| Ok(())).collect());
        }
        self.fan_out(items, |this: &Store, (key, value): (String, Value)| async move {
            this.put(&key, value).await
        })
        .await
    }

    pub async fn get_multi(&self, keys: Vec<String>) -> Result<Vec<Result<Value>>> {
        self.fan_out(keys, |this: &Store, key: String| async move { this.get(&key).await })
            .await
    }

    pub async fn head_multi(&self, keys: Vec<String>) -> Result<Vec<Result<RecordInfo>>> {
        self.fan_out(keys, |this: &Store, key: String| async move { this.head(&key).await })
            .await
    }

    pub async fn delete_multi(&self, keys: Vec<String>) -> Result<Vec<Result<()>>> {
        self.fan_out(keys, |this: &Store, key: String| async move { this.delete(&key).await })
            .await
    }

    /// Drive `items` through `op` with at most `config.concurrency`
    /// in flight at once (§4.2's batch-operation contract).
    async fn fan_out<'a, T, R, F, Fut>(&'a self, items: Vec<T>, op: F) -> Result<Vec<Result<R>>>
    where
        F: Fn(&'a Store, T) -> Fut,
        Fut: std::future::Future<Output = Result<R>> + 'a,
    {
        use futures::stream::{self, StreamExt};
        let results = stream::iter(items)
            .map(|item| op(self, item))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        Ok(results)
    }

    /// Normalize `epoch` to midnight and enqueue an `expire_set` task
    /// (§3.7, §4.2).
    pub async fn expire(&self, key: &str, epoch: i64, force: bool) -> Result<()> {
        let normalized = normalize(key);
        let now = Utc::now().timestamp();
        let expiration = normalize_expiration(epoch, force, now);
        self.queue
            .enqueue(Task::ExpireSet {
                key: normalized.to_string(),
                expiration,
            })
            .await;
        Ok(())
    }

    pub async fn enqueue(&self, task: Task) {
        self.queue.enqueue(task).await;
    }

    pub async fn lock(&self, key: &str) -> LockGuard<'_> {
        self.locks.lock(&namespace::user(key)).await
    }

    pub fn unlock(&self, key: &str) {
        self.locks.unlock(&namespace::user(key));
    }

    pub async fn share_lock(&self, key: &str) -> LockGuard<'_> {
        self.locks.share_lock(&namespace::user(key)).await
    }

    pub fn share_unlock(&self, key: &str) {
        self.locks.share_unlock(&namespace::user(key));
    }

    async fn delete_by_type(&self, key: &str) -> Result<()> {
        match self.engine.get(key).await {
            Ok((bytes, _)) => {
                let kind = serde_json::from_slice::<Json>(&bytes)
                    .map(|v| record_kind(&v))
                    .unwrap_or(RecordKind::Opaque);
                match kind {
                    RecordKind::List => self.list.delete(key, true).await,
                    RecordKind::Hash => self.hash.delete_all(key, true).await,
                    _ => self.engine.delete(key).await,
                }
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Daily maintenance (§4.2's `runMaintenance`): walk the cleanup
    /// list for `date` (today, if unset), dispatch each listed key's
    /// deletion by its record type unless it was re-`expire`d to a later
    /// date after being listed, then call the engine's own hook.
    pub async fn run_maintenance(&self, date: Option<NaiveDate>) -> Result<()> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        let list_key = format!("_cleanup/{:04}/{:02}/{:02}", date.year(), date.month(), date.day());
        let keys = self.list.get(&list_key, 0, 0).await?;
        for item in keys {
            if let Some(key) = item.as_str() {
                if self.expiration_pushed_forward(key, date).await? {
                    continue;
                }
                self.delete_by_type(key).await?;
            }
        }
        self.list.delete(&list_key, true).await.ok();
        self.engine.run_maintenance().await
    }

    /// Whether `key`'s current expiration, per the `_cleanup/expires`
    /// mirror hash, now falls after `date`'s midnight — i.e. it was
    /// re-`expire`d to a later day after already being recorded on
    /// today's cleanup list (§3.7, §4.2). Only consulted when
    /// `expiration_updates` is configured; otherwise the mirror hash
    /// isn't kept up to date and can't be trusted.
    async fn expiration_pushed_forward(&self, key: &str, date: NaiveDate) -> Result<bool> {
        if !self.config.expiration_updates {
            return Ok(false);
        }
        let today_midnight = date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        match self.hash.get(EXPIRES_HASH_KEY, key).await {
            Ok(value) => Ok(value
                .get("expires")
                .and_then(|v| v.as_i64())
                .is_some_and(|expires| expires > today_midnight)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn get_stats(&self) -> Stats {
        self.counters.snapshot(self.cache.len(), self.queue.depth())
    }

    /// Wait for the task queue to drain, then for all locks to
    /// release (polling every 250 ms), then shut the engine down
    /// (§4.2).
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.drain().await;
        while self.locks.outstanding() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        self.engine.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_engine::MemoryEngine;

    fn store() -> Store {
        Store::new(Arc::new(MemoryEngine::new()), StoreConfig::default())
    }

    #[tokio::test]
    async fn put_get_round_trip_json_and_binary() {
        let s = store();
        s.put("users/bob", Value::Json(json!({"age": 9}))).await.unwrap();
        assert_eq!(s.get("users/bob").await.unwrap(), Value::Json(json!({"age": 9})));

        s.put("avatars/bob.gif", Value::Buffer(vec![1, 2, 3])).await.unwrap();
        assert_eq!(s.get_buffer("avatars/bob.gif").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn buffer_rejected_on_json_key() {
        let s = store();
        let err = s.put("users/bob", Value::Buffer(vec![1])).await.unwrap_err();
        assert_eq!(err.code(), "InvalidInput");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let s = store();
        assert!(s.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_invalidates_cache() {
        let s = Store::new(
            Arc::new(MemoryEngine::new()),
            StoreConfig {
                cache_key_match: Some(regex::Regex::new(".*").unwrap()),
                ..StoreConfig::default()
            },
        );
        s.put("k", Value::Json(json!(1))).await.unwrap();
        assert_eq!(s.get_stats().cache_size, 1);
        s.delete("k").await.unwrap();
        assert_eq!(s.get_stats().cache_size, 0);
        assert!(s.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn copy_and_rename() {
        let s = store();
        s.put("a", Value::Json(json!(1))).await.unwrap();
        s.copy("a", "b").await.unwrap();
        assert_eq!(s.get("b").await.unwrap(), Value::Json(json!(1)));
        s.rename("b", "c").await.unwrap();
        assert!(s.get("b").await.unwrap_err().is_not_found());
        assert_eq!(s.get("c").await.unwrap(), Value::Json(json!(1)));
    }

    #[tokio::test]
    async fn multi_operations_fan_out() {
        let s = store();
        let items = vec![
            ("a".to_string(), Value::Json(json!(1))),
            ("b".to_string(), Value::Json(json!(2))),
        ];
        let results = s.put_multi(items).await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));

        let fetched = s.get_multi(vec!["a".into(), "b".into(), "missing".into()]).await.unwrap();
        assert_eq!(fetched[0].as_ref().unwrap(), &Value::Json(json!(1)));
        assert_eq!(fetched[1].as_ref().unwrap(), &Value::Json(json!(2)));
        assert!(fetched[2].as_ref().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn expire_then_maintenance_deletes_key() {
        let s = store();
        s.put("sessions/a", Value::Json(json!({"v": 1}))).await.unwrap();

        let today = Utc::now().date_naive();
        let midnight = today.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        s.expire("sessions/a", midnight, true).await.unwrap();
        s.queue.drain().await;

        s.run_maintenance(Some(today)).await.unwrap();
        assert!(s.get("sessions/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn maintenance_skips_key_reexpired_to_a_later_date() {
        let s = Store::new(
            Arc::new(MemoryEngine::new()),
            StoreConfig {
                expiration_updates: true,
                ..StoreConfig::default()
            },
        );
        s.put("sessions/a", Value::Json(json!({"v": 1}))).await.unwrap();

        let today = Utc::now().date_naive();
        let midnight = today.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        s.expire("sessions/a", midnight, true).await.unwrap();
        s.queue.drain().await;

        let tomorrow = today.succ_opt().unwrap();
        let tomorrow_midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        s.expire("sessions/a", tomorrow_midnight, true).await.unwrap();
        s.queue.drain().await;

        s.run_maintenance(Some(today)).await.unwrap();
        assert_eq!(s.get("sessions/a").await.unwrap(), Value::Json(json!({"v": 1})));
    }

    #[tokio::test]
    async fn maintenance_deletes_a_whole_list() {
        let s = store();
        s.list.create("mylist", 10).await.unwrap();
        s.list.push("mylist", vec![json!(1), json!(2)]).await.unwrap();

        let today = Utc::now().date_naive();
        let midnight = today.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        s.expire("mylist", midnight, true).await.unwrap();
        s.queue.drain().await;

        s.run_maintenance(Some(today)).await.unwrap();
        assert_eq!(s.list.get("mylist", 0, 0).await.unwrap(), Vec::<Json>::new());
    }

    #[tokio::test]
    async fn lock_passthrough_excludes_concurrent_holders() {
        let s = store();
        let g = s.lock("k").await;
        assert!(s.locks.try_lock(&namespace::user("k")).is_err());
        g.release();
    }

    #[tokio::test]
    async fn shutdown_waits_for_queue_and_locks() {
        let s = store();
        let g = s.lock("k").await;
        g.release();
        s.shutdown().await.unwrap();
    }
}
