//! The paged digest-trie hash container (§4.4, §3.4).
//!
//! A hash at key `K` is a header plus a tree rooted at `K/data`: either a
//! leaf (`hash_page`) or an inner node (`hash_index`) with up to 16
//! children addressed by a lower-case hex nibble of `md5_hex(user_key)`.

use kvlayer_core::record::{record_kind, HashHeader, HashIndexNode, HashLeaf, RecordKind};
use kvlayer_core::{md5_hex, Engine, Error, Result};
use kvlayer_locks::{namespace, LockManager};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default page size (§6.2: `hash_page_size` default 50).
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// How many entries `get_multi` reads concurrently.
const MULTI_CONCURRENCY: usize = 8;

/// One of the two shapes a tree node can have once decoded.
enum Node {
    Leaf(HashLeaf),
    Inner,
}

/// The paged hash container, sharing an `Engine` and `LockManager` with
/// every other container in the host `Database`.
#[derive(Clone)]
pub struct HashStore {
    engine: Arc<dyn Engine>,
    locks: Arc<LockManager>,
}

fn root_path(key: &str) -> String {
    format!("{key}/data")
}

fn child_path(node_path: &str, nibble: char) -> String {
    format!("{node_path}/{nibble}")
}

/// The routing nibble for `user_key` at tree depth `depth` (root = 0).
fn nibble_at(user_key: &str, depth: usize) -> char {
    md5_hex(user_key)
        .chars()
        .nth(depth)
        .expect("md5 hex digest has 32 nibbles, far more than any realistic tree depth")
}

impl HashStore {
    pub fn new(engine: Arc<dyn Engine>, locks: Arc<LockManager>) -> Self {
        HashStore { engine, locks }
    }

    async fn read_header(&self, key: &str) -> Result<Option<HashHeader>> {
        match self.engine.get(key).await {
            Ok((bytes, _)) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                Error::ParseError(format!("corrupt hash header at '{key}': {e}"))
            })?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_header(&self, key: &str, header: &HashHeader) -> Result<()> {
        let bytes = serde_json::to_vec(header).expect("HashHeader always serializes");
        self.engine.put(key, &bytes).await
    }

    async fn read_node(&self, path: &str) -> Result<Option<Node>> {
        match self.engine.get(path).await {
            Ok((bytes, _)) => {
                let raw: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::ParseError(format!("corrupt hash node at '{path}': {e}"))
                })?;
                Ok(Some(match record_kind(&raw) {
                    RecordKind::HashIndex => Node::Inner,
                    _ => Node::Leaf(serde_json::from_value(raw).map_err(|e| {
                        Error::ParseError(format!("corrupt hash leaf at '{path}': {e}"))
                    })?),
                }))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_leaf(&self, path: &str, leaf: &HashLeaf) -> Result<()> {
        let bytes = serde_json::to_vec(leaf).expect("HashLeaf always serializes");
        self.engine.put(path, &bytes).await
    }

    async fn write_inner(&self, path: &str) -> Result<()> {
        let bytes = serde_json::to_vec(&HashIndexNode::default()).expect("always serializes");
        self.engine.put(path, &bytes).await
    }

    /// Create a hash at `key` if one does not already exist (§4.4).
    pub async fn create(&self, key: &str, page_size: usize) -> Result<HashHeader> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        self.create_locked(key, page_size).await
    }

    async fn create_locked(&self, key: &str, page_size: usize) -> Result<HashHeader> {
        if let Some(existing) = self.read_header(key).await? {
            return Ok(existing);
        }
        let header = HashHeader::new(page_size);
        self.write_leaf(&root_path(key), &HashLeaf::empty()).await?;
        self.write_header(key, &header).await?;
        Ok(header)
    }

    async fn header_or_create(&self, key: &str) -> Result<HashHeader> {
        match self.read_header(key).await? {
            Some(h) => Ok(h),
            None => self.create_locked(key, DEFAULT_PAGE_SIZE).await,
        }
    }

    /// Descend from the root to the leaf that would hold `user_key`,
    /// returning the leaf's path and depth.
    async fn find_leaf(&self, key: &str, user_key: &str) -> Result<(String, usize, HashLeaf)> {
        let mut path = root_path(key);
        let mut depth = 0;
        loop {
            match self.read_node(&path).await?.ok_or_else(|| {
                Error::EngineError(format!("hash '{key}' is missing its node at '{path}'"))
            })? {
                Node::Leaf(leaf) => return Ok((path, depth, leaf)),
                Node::Inner => {
                    let nibble = nibble_at(user_key, depth);
                    path = child_path(&path, nibble);
                    depth += 1;
                }
            }
        }
    }

    /// Insert or replace `user_key => value`. Auto-creates the hash with
    /// default options if it doesn't exist yet (§4.4).
    pub async fn put(&self, key: &str, user_key: &str, value: Value) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        self.put_locked(key, user_key, value).await
    }

    async fn put_locked(&self, key: &str, user_key: &str, value: Value) -> Result<()> {
        let mut header = self.header_or_create(key).await?;
        let (path, depth, mut leaf) = self.find_leaf(key, user_key).await?;
        let is_new = !leaf.items.contains_key(user_key);

        if !is_new || leaf.items.len() < header.page_size {
            leaf.items.insert(user_key.to_string(), value);
            leaf.length = leaf.items.len();
            self.write_leaf(&path, &leaf).await?;
        } else {
            // Splitting would push this leaf past page_size: promote it
            // to an inner node and redistribute by next nibble (§4.4).
            leaf.items.insert(user_key.to_string(), value);
            let mut buckets: BTreeMap<char, BTreeMap<String, Value>> = BTreeMap::new();
            for (k, v) in leaf.items {
                let nibble = nibble_at(&k, depth);
                buckets.entry(nibble).or_default().insert(k, v);
            }
            for (nibble, items) in buckets {
                let child_leaf = HashLeaf {
                    kind: Default::default(),
                    length: items.len(),
                    items,
                };
                self.write_leaf(&child_path(&path, nibble), &child_leaf)
                    .await?;
            }
            self.write_inner(&path).await?;
            tracing::debug!(key, path, depth, "hash leaf split into inner node");
        }

        if is_new {
            header.length += 1;
            self.write_header(key, &header).await?;
        }
        Ok(())
    }

    /// Read-modify-write: merge `patch`'s fields into the stored JSON
    /// object at `user_key`, preserving any other fields (§4.4's
    /// `hashUpdate`).
    pub async fn update(&self, key: &str, user_key: &str, patch: serde_json::Map<String, Value>) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let existing = match self.get_locked(key, user_key).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => Value::Object(serde_json::Map::new()),
            Err(e) => return Err(e),
        };
        let mut obj = existing.as_object().cloned().unwrap_or_default();
        for (k, v) in patch {
            obj.insert(k, v);
        }
        self.put_locked(key, user_key, Value::Object(obj)).await
    }

    /// Look up `user_key`'s value (§4.4).
    pub async fn get(&self, key: &str, user_key: &str) -> Result<Value> {
        let _guard = self.locks.lock(&namespace::list_shared(key)).await;
        self.get_locked(key, user_key).await
    }

    async fn get_locked(&self, key: &str, user_key: &str) -> Result<Value> {
        let (_, _, leaf) = self.find_leaf(key, user_key).await?;
        leaf.items
            .get(user_key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{key}/{user_key}")))
    }

    /// Remove `user_key`, then walk back up the tree unsplitting any
    /// ancestor whose aggregate item count now fits in one page (§4.4).
    pub async fn delete(&self, key: &str, user_key: &str) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        self.delete_locked(key, user_key).await
    }

    async fn delete_locked(&self, key: &str, user_key: &str) -> Result<()> {
        let mut header = self
            .read_header(key)
            .await?
            .ok_or_else(|| Error::not_found(key))?;

        let mut path = root_path(key);
        let mut depth = 0;
        let mut ancestors = Vec::new();
        loop {
            match self
                .read_node(&path)
                .await?
                .ok_or_else(|| Error::EngineError(format!("missing node at '{path}'")))?
            {
                Node::Leaf(mut leaf) => {
                    if leaf.items.remove(user_key).is_none() {
                        return Err(Error::not_found(format!("{key}/{user_key}")));
                    }
                    leaf.length = leaf.items.len();
                    self.write_leaf(&path, &leaf).await?;
                    break;
                }
                Node::Inner => {
                    ancestors.push(path.clone());
                    let nibble = nibble_at(user_key, depth);
                    path = child_path(&path, nibble);
                    depth += 1;
                }
            }
        }

        header.length -= 1;
        self.write_header(key, &header).await?;

        for ancestor in ancestors.into_iter().rev() {
            let total = self.subtree_count(&ancestor).await?;
            if total > header.page_size {
                break;
            }
            let mut merged = BTreeMap::new();
            self.collapse_into(&ancestor, &mut merged).await?;
            let leaf = HashLeaf {
                kind: Default::default(),
                length: merged.len(),
                items: merged,
            };
            self.write_leaf(&ancestor, &leaf).await?;
            tracing::debug!(key, ancestor, total, "hash inner node unsplit back to leaf");
        }
        Ok(())
    }

    fn subtree_count<'a>(
        &'a self,
        path: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            match self.read_node(path).await?.ok_or_else(|| {
                Error::EngineError(format!("missing node at '{path}'"))
            })? {
                Node::Leaf(leaf) => Ok(leaf.items.len()),
                Node::Inner => {
                    let mut total = 0;
                    for nibble in HEX_NIBBLES {
                        let p = child_path(path, nibble);
                        if let Some(_) = self.read_node(&p).await? {
                            total += self.subtree_count(&p).await?;
                        }
                    }
                    Ok(total)
                }
            }
        })
    }

    fn collapse_into<'a>(
        &'a self,
        path: &'a str,
        merged: &'a mut BTreeMap<String, Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            for nibble in HEX_NIBBLES {
                let p = child_path(path, nibble);
                match self.read_node(&p).await? {
                    None => continue,
                    Some(Node::Leaf(leaf)) => {
                        merged.extend(leaf.items);
                        self.engine.delete(&p).await.ok();
                    }
                    Some(Node::Inner) => {
                        self.collapse_into(&p, merged).await?;
                        self.engine.delete(&p).await.ok();
                    }
                }
            }
            Ok(())
        })
    }

    /// Insert several entries under one lock acquisition. Runs
    /// sequentially: each insert can promote a leaf to an inner node and
    /// redistribute its siblings, so later inserts in the same batch
    /// need to see earlier ones' split decisions (§4.4's `hashPutMulti`).
    pub async fn put_multi(&self, key: &str, items: Vec<(String, Value)>) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        for (k, v) in items {
            self.put_locked(key, &k, v).await?;
        }
        Ok(())
    }

    /// Look up several entries under one lock acquisition, returning
    /// `None` for keys that aren't present rather than failing the whole
    /// batch. Reads don't mutate the tree, so up to `MULTI_CONCURRENCY`
    /// of them run concurrently while still returning results in
    /// `user_keys`' order (§4.4's `hashGetMulti`).
    pub async fn get_multi(&self, key: &str, user_keys: &[String]) -> Result<Vec<Option<Value>>> {
        use futures::stream::{self, StreamExt};
        let _guard = self.locks.lock(&namespace::list_shared(key)).await;
        let out = stream::iter(user_keys)
            .map(|uk| self.get_locked(key, uk))
            .buffered(MULTI_CONCURRENCY)
            .map(|r| r.ok())
            .collect::<Vec<_>>()
            .await;
        Ok(out)
    }

    /// Delete several entries under one lock acquisition, tolerating
    /// already-missing keys. Runs sequentially under the single lock:
    /// each deletion can split and collapse ancestor nodes, so parallel
    /// deletes against the same tree would race on those shared nodes
    /// (§4.4's `hashDeleteMulti`).
    pub async fn delete_multi(&self, key: &str, user_keys: &[String]) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        for uk in user_keys {
            match self.delete_locked(key, uk).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stream every leaf, returning the union of all entries (§4.4's
    /// `hashGetAll`).
    pub async fn get_all(&self, key: &str) -> Result<BTreeMap<String, Value>> {
        let _guard = self.locks.lock(&namespace::list_shared(key)).await;
        let mut out = BTreeMap::new();
        self.collect_all(&root_path(key), &mut out).await?;
        Ok(out)
    }

    fn collect_all<'a>(
        &'a self,
        path: &'a str,
        out: &'a mut BTreeMap<String, Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self.read_node(path).await?.ok_or_else(|| {
                Error::EngineError(format!("missing node at '{path}'"))
            })? {
                Node::Leaf(leaf) => {
                    out.extend(leaf.items);
                    Ok(())
                }
                Node::Inner => {
                    for nibble in HEX_NIBBLES {
                        let p = child_path(path, nibble);
                        if self.read_node(&p).await?.is_some() {
                            self.collect_all(&p, out).await?;
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    /// Shared-lock traversal calling `f(user_key, value)` for every
    /// entry. `f` returning `Ok(false)` stops the traversal early (§4.4's
    /// `hashEach`).
    pub async fn each<F>(&self, key: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &Value) -> Result<bool>,
    {
        let all = self.get_all(key).await?;
        for (k, v) in &all {
            if !f(k, v)? {
                break;
            }
        }
        Ok(())
    }

    /// Delete the whole hash: every leaf, every inner node, then the
    /// header, unless `entire` is false, in which case the header and
    /// root leaf are reset to empty (§4.4's `hashDeleteAll`).
    pub async fn delete_all(&self, key: &str, entire: bool) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        if self.read_header(key).await?.is_none() {
            return Ok(());
        }
        self.wipe_subtree(&root_path(key)).await?;
        if entire {
            self.engine.delete(key).await.ok();
        } else {
            self.write_leaf(&root_path(key), &HashLeaf::empty()).await?;
            self.write_header(key, &HashHeader::new(DEFAULT_PAGE_SIZE))
                .await?;
        }
        Ok(())
    }

    fn wipe_subtree<'a>(
        &'a self,
        path: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self.read_node(path).await? {
                None => {}
                Some(Node::Leaf(_)) => {
                    self.engine.delete(path).await.ok();
                }
                Some(Node::Inner) => {
                    for nibble in HEX_NIBBLES {
                        let p = child_path(path, nibble);
                        self.wipe_subtree(&p).await?;
                    }
                    self.engine.delete(path).await.ok();
                }
            }
            Ok(())
        })
    }

    /// Copy every leaf and inner node from `src` to `dst` (§4.4's
    /// `hashCopy`).
    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let _src_guard = self.locks.lock(&namespace::list_shared(src)).await;
        let header = self
            .read_header(src)
            .await?
            .ok_or_else(|| Error::not_found(src))?;
        let _dst_guard = self.locks.lock(&namespace::list_exclusive(dst)).await;
        self.copy_subtree(&root_path(src), &root_path(dst)).await?;
        self.write_header(dst, &header).await
    }

    fn copy_subtree<'a>(
        &'a self,
        src: &'a str,
        dst: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            match self.read_node(src).await?.ok_or_else(|| {
                Error::EngineError(format!("missing node at '{src}'"))
            })? {
                Node::Leaf(leaf) => self.write_leaf(dst, &leaf).await,
                Node::Inner => {
                    self.write_inner(dst).await?;
                    for nibble in HEX_NIBBLES {
                        let child_src = child_path(src, nibble);
                        if self.read_node(&child_src).await?.is_some() {
                            self.copy_subtree(&child_src, &child_path(dst, nibble))
                                .await?;
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    /// Copy then delete the source: `rename(src, dst)` (§4.4's
    /// `hashRename`).
    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.copy(src, dst).await?;
        self.delete_all(src, true).await
    }
}

const HEX_NIBBLES: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_engine::MemoryEngine;
    use serde_json::json;

    fn store() -> HashStore {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        HashStore::new(engine, Arc::new(LockManager::new()))
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let s = store();
        s.create("myhash", 10).await.unwrap();
        s.put("myhash", "a", json!(1)).await.unwrap();
        s.put("myhash", "b", json!(2)).await.unwrap();
        assert_eq!(s.get("myhash", "a").await.unwrap(), json!(1));
        assert_eq!(s.get("myhash", "b").await.unwrap(), json!(2));
        assert!(s.get("myhash", "c").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn hash_round_trip_property() {
        let s = store();
        s.create("myhash", 5).await.unwrap();
        let mut model = BTreeMap::new();
        for i in 0..50 {
            let k = format!("key{i}");
            let v = json!(format!("value-{i}"));
            s.put("myhash", &k, v.clone()).await.unwrap();
            model.insert(k, v);
        }
        let all = s.get_all("myhash").await.unwrap();
        assert_eq!(all, model);

        for i in (0..50).step_by(3) {
            let k = format!("key{i}");
            s.delete("myhash", &k).await.unwrap();
            model.remove(&k);
        }
        let all = s.get_all("myhash").await.unwrap();
        assert_eq!(all, model);
    }

    #[tokio::test]
    async fn split_example_matches_worked_scenario() {
        // §8 scenario 2: page_size=10, insert key0..key10 (11 keys).
        let s = store();
        s.create("myhash", 10).await.unwrap();
        for i in 0..=10 {
            s.put("myhash", &format!("key{i}"), json!(format!("Value {}", i * 1000)))
                .await
                .unwrap();
        }
        let header = s.read_header("myhash").await.unwrap().unwrap();
        assert_eq!(header.length, 11);
        // root must now be an inner node.
        assert!(matches!(
            s.read_node(&root_path("myhash")).await.unwrap(),
            Some(Node::Inner)
        ));
        let nibble0 = nibble_at("key9", 0);
        assert_eq!(nibble0, '0', "md5(key9) is expected to start with '0'");
        let child = s
            .read_node(&child_path(&root_path("myhash"), '0'))
            .await
            .unwrap();
        match child {
            Some(Node::Leaf(leaf)) => {
                assert_eq!(leaf.items.len(), 1);
                assert_eq!(leaf.items.get("key9").unwrap(), "Value 9000");
            }
            _ => panic!("expected a leaf at K/data/0"),
        }
    }

    #[tokio::test]
    async fn unsplit_collapses_back_to_a_single_leaf() {
        let s = store();
        s.create("myhash", 5).await.unwrap();
        for i in 0..30 {
            s.put("myhash", &format!("k{i}"), json!(i)).await.unwrap();
        }
        for i in 0..27 {
            s.delete("myhash", &format!("k{i}")).await.unwrap();
        }
        let header = s.read_header("myhash").await.unwrap().unwrap();
        assert_eq!(header.length, 3);
        assert!(matches!(
            s.read_node(&root_path("myhash")).await.unwrap(),
            Some(Node::Leaf(_))
        ));
    }

    #[tokio::test]
    async fn dangerous_key_names_round_trip() {
        let s = store();
        s.create("myhash", 50).await.unwrap();
        for dangerous in ["__proto__", "constructor", "prototype", "hasOwnProperty"] {
            s.put("myhash", dangerous, json!("poison")).await.unwrap();
        }
        for dangerous in ["__proto__", "constructor", "prototype", "hasOwnProperty"] {
            assert_eq!(s.get("myhash", dangerous).await.unwrap(), json!("poison"));
        }
    }

    #[tokio::test]
    async fn update_preserves_other_fields() {
        let s = store();
        s.create("myhash", 50).await.unwrap();
        s.put("myhash", "k", json!({"a": 1, "b": 2})).await.unwrap();
        let mut patch = serde_json::Map::new();
        patch.insert("b".into(), json!(99));
        s.update("myhash", "k", patch).await.unwrap();
        assert_eq!(s.get("myhash", "k").await.unwrap(), json!({"a": 1, "b": 99}));
    }

    #[tokio::test]
    async fn multi_operations_preserve_order_and_tolerate_missing_keys() {
        let s = store();
        s.create("myhash", 50).await.unwrap();
        s.put_multi(
            "myhash",
            vec![("a".into(), json!(1)), ("b".into(), json!(2)), ("c".into(), json!(3))],
        )
        .await
        .unwrap();

        let fetched = s
            .get_multi("myhash", &["a".into(), "missing".into(), "c".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(fetched, vec![Some(json!(1)), None, Some(json!(3)), Some(json!(2))]);

        s.delete_multi("myhash", &["a".into(), "missing".into(), "b".into()])
            .await
            .unwrap();
        let all = s.get_all("myhash").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("c"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn copy_and_rename() {
        let s = store();
        s.create("src", 5).await.unwrap();
        for i in 0..20 {
            s.put("src", &format!("k{i}"), json!(i)).await.unwrap();
        }
        s.copy("src", "dst").await.unwrap();
        assert_eq!(s.get_all("src").await.unwrap(), s.get_all("dst").await.unwrap());

        s.rename("dst", "dst2").await.unwrap();
        assert!(s.read_header("dst").await.unwrap().is_none());
        assert_eq!(s.get_all("dst2").await.unwrap().len(), 20);
    }
}
