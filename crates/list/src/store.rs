//! The paged list container (§4.3, §3.3).
//!
//! A list at key `K` is a header plus pages `K/F .. K/G`. All mutating
//! operations take the list's exclusive structural lock (`|K`); read-only
//! iteration takes the shared structural lock (`C|K`).

use crate::criteria::{matches, Criteria};
use kvlayer_core::record::{ListHeader, ListPage};
use kvlayer_core::{Engine, Error, Result};
use kvlayer_locks::{namespace, LockManager};
use serde_json::Value;
use std::sync::Arc;

/// Default page size (§6.2: `list_page_size` default 50).
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// What `each_update`'s callback asks to happen to the item it was
/// given (§4.3's `listEachUpdate`).
pub enum ItemUpdate {
    /// Leave the item as it is.
    Keep,
    /// Overwrite the item with this value.
    Replace(Value),
    /// Remove the item from the list.
    Delete,
}

/// The paged list container, sharing an `Engine` and `LockManager` with
/// every other container in the host `Database`.
#[derive(Clone)]
pub struct ListStore {
    engine: Arc<dyn Engine>,
    locks: Arc<LockManager>,
}

fn page_key(list_key: &str, idx: i64) -> String {
    format!("{list_key}/{idx}")
}

impl ListStore {
    pub fn new(engine: Arc<dyn Engine>, locks: Arc<LockManager>) -> Self {
        ListStore { engine, locks }
    }

    async fn read_header(&self, key: &str) -> Result<Option<ListHeader>> {
        match self.engine.get(key).await {
            Ok((bytes, _)) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                Error::ParseError(format!("corrupt list header at '{key}': {e}"))
            })?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_header(&self, key: &str, header: &ListHeader) -> Result<()> {
        let bytes = serde_json::to_vec(header).expect("ListHeader always serializes");
        self.engine.put(key, &bytes).await
    }

    async fn read_page(&self, list_key: &str, idx: i64) -> Result<ListPage> {
        let (bytes, _) = self.engine.get(&page_key(list_key, idx)).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::ParseError(format!("corrupt list page at '{list_key}/{idx}': {e}")))
    }

    async fn write_page(&self, list_key: &str, idx: i64, page: &ListPage) -> Result<()> {
        let bytes = serde_json::to_vec(page).expect("ListPage always serializes");
        self.engine.put(&page_key(list_key, idx), &bytes).await
    }

    async fn delete_page(&self, list_key: &str, idx: i64) -> Result<()> {
        match self.engine.delete(&page_key(list_key, idx)).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a list at `key` if one does not already exist. Idempotent:
    /// if a list already exists, its current header is returned
    /// unchanged (§4.3).
    pub async fn create(&self, key: &str, page_size: usize) -> Result<ListHeader> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        self.create_locked(key, page_size).await
    }

    async fn create_locked(&self, key: &str, page_size: usize) -> Result<ListHeader> {
        if let Some(existing) = self.read_header(key).await? {
            return Ok(existing);
        }
        let header = ListHeader::new(page_size);
        self.write_page(key, 0, &ListPage::empty()).await?;
        self.write_header(key, &header).await?;
        Ok(header)
    }

    async fn header_or_create(&self, key: &str) -> Result<ListHeader> {
        match self.read_header(key).await? {
            Some(h) => Ok(h),
            None => self.create_locked(key, DEFAULT_PAGE_SIZE).await,
        }
    }

    /// Append `items` to the tail of the list (§4.3).
    pub async fn push(&self, key: &str, items: Vec<Value>) -> Result<ListHeader> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let mut header = self.header_or_create(key).await?;
        if items.is_empty() {
            return Ok(header);
        }
        let mut idx = header.last_page;
        let mut page = self.read_page(key, idx).await?;
        for item in items.iter() {
            if page.items.len() == header.page_size {
                self.write_page(key, idx, &page).await?;
                idx += 1;
                page = ListPage::empty();
            }
            page.items.push(item.clone());
        }
        self.write_page(key, idx, &page).await?;
        header.length += items.len();
        header.last_page = idx;
        self.write_header(key, &header).await?;
        Ok(header)
    }

    /// Prepend `items` to the head of the list, preserving their order
    /// (§4.3).
    pub async fn unshift(&self, key: &str, items: Vec<Value>) -> Result<ListHeader> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let mut header = self.header_or_create(key).await?;
        if items.is_empty() {
            return Ok(header);
        }
        let mut idx = header.first_page;
        let mut page = self.read_page(key, idx).await?;
        for item in items.iter().rev() {
            if page.items.len() == header.page_size {
                self.write_page(key, idx, &page).await?;
                idx -= 1;
                page = ListPage::empty();
            }
            page.items.insert(0, item.clone());
        }
        self.write_page(key, idx, &page).await?;
        header.length += items.len();
        header.first_page = idx;
        self.write_header(key, &header).await?;
        Ok(header)
    }

    /// Remove and return the last item, or `None` on an empty list
    /// (§4.3).
    pub async fn pop(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let Some(mut header) = self.read_header(key).await? else {
            return Ok(None);
        };
        if header.length == 0 {
            return Ok(None);
        }
        let idx = header.last_page;
        let mut page = self.read_page(key, idx).await?;
        let item = page.items.pop();
        header.length -= 1;
        if page.items.is_empty() && header.first_page != header.last_page {
            self.delete_page(key, idx).await?;
            header.last_page -= 1;
        } else if page.items.is_empty() {
            header.first_page = idx;
            header.last_page = idx;
            self.write_page(key, idx, &ListPage::empty()).await?;
        } else {
            self.write_page(key, idx, &page).await?;
        }
        self.write_header(key, &header).await?;
        Ok(item)
    }

    /// Remove and return the first item, or `None` on an empty list
    /// (§4.3).
    pub async fn shift(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let Some(mut header) = self.read_header(key).await? else {
            return Ok(None);
        };
        if header.length == 0 {
            return Ok(None);
        }
        let idx = header.first_page;
        let mut page = self.read_page(key, idx).await?;
        if page.items.is_empty() {
            return Ok(None);
        }
        let item = page.items.remove(0);
        header.length -= 1;
        if page.items.is_empty() && header.first_page != header.last_page {
            self.delete_page(key, idx).await?;
            header.first_page += 1;
        } else if page.items.is_empty() {
            header.first_page = idx;
            header.last_page = idx;
            self.write_page(key, idx, &ListPage::empty()).await?;
        } else {
            self.write_page(key, idx, &page).await?;
        }
        self.write_header(key, &header).await?;
        Ok(Some(item))
    }

    /// Resolve a possibly-negative logical index against `length`,
    /// clamping negative results to 0 (§4.3's `listGet`/`listSplice`
    /// negative-index convention).
    fn resolve_index(idx: i64, length: usize) -> usize {
        if idx < 0 {
            let from_tail = length as i64 + idx;
            from_tail.max(0) as usize
        } else {
            (idx as usize).min(length)
        }
    }

    /// Read `len` items (0 means "to the end") starting at logical index
    /// `idx` (§4.3).
    pub async fn get(&self, key: &str, idx: i64, len: usize) -> Result<Vec<Value>> {
        let _guard = self.locks.lock(&namespace::list_shared(key)).await;
        let Some(header) = self.read_header(key).await? else {
            return Ok(Vec::new());
        };
        let start = Self::resolve_index(idx, header.length);
        if start >= header.length {
            return Ok(Vec::new());
        }
        let want = if len == 0 { header.length - start } else { len };
        let flat = self.read_all_locked(key, &header).await?;
        let end = (start + want).min(flat.len());
        Ok(flat[start..end].to_vec())
    }

    async fn read_all_locked(&self, key: &str, header: &ListHeader) -> Result<Vec<Value>> {
        let mut flat = Vec::with_capacity(header.length);
        let mut idx = header.first_page;
        while idx <= header.last_page {
            let page = self.read_page(key, idx).await?;
            flat.extend(page.items);
            idx += 1;
        }
        Ok(flat)
    }

    /// Splice the list: remove `cut_len` items starting at logical index
    /// `idx` and insert `new_items` in their place, returning the removed
    /// items in original order (§4.3, §8's splice law).
    ///
    /// Internally this flattens the list, performs the splice on a plain
    /// `Vec`, and re-chunks the result into pages anchored at the list's
    /// existing `first_page` (documented as a grounded simplification in
    /// DESIGN.md — it satisfies every invariant and the worked example in
    /// §8 without needing the source's four-strategy page-shuffling walk).
    pub async fn splice(
        &self,
        key: &str,
        idx: i64,
        cut_len: usize,
        new_items: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let mut header = self
            .read_header(key)
            .await?
            .ok_or_else(|| Error::not_found(key))?;

        let start = Self::resolve_index(idx, header.length);
        let cut = cut_len.min(header.length.saturating_sub(start));

        let mut flat = self.read_all_locked(key, &header).await?;
        let removed: Vec<Value> = flat.splice(start..start + cut, new_items).collect();

        let anchor = header.first_page;
        let old_last = header.last_page;
        let new_pages = chunk_with_trailing_remainder(&flat, header.page_size);

        for (offset, chunk) in new_pages.iter().enumerate() {
            let page = ListPage {
                kind: Default::default(),
                items: chunk.clone(),
            };
            self.write_page(key, anchor + offset as i64, &page).await?;
        }
        let new_last = anchor + new_pages.len() as i64 - 1;
        for stale in (new_last + 1)..=old_last {
            self.delete_page(key, stale).await?;
        }
        if new_last < old_last {
            tracing::debug!(key, freed = old_last - new_last, "list splice freed trailing pages");
        }

        header.length = flat.len();
        header.first_page = anchor;
        header.last_page = new_last;
        self.write_header(key, &header).await?;
        Ok(removed)
    }

    /// Delete a list: remove all of its pages, and, if `entire`, the
    /// header too; otherwise leave an empty list in place (§4.3).
    pub async fn delete(&self, key: &str, entire: bool) -> Result<()> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let Some(header) = self.read_header(key).await? else {
            return Ok(());
        };
        let mut idx = header.first_page;
        while idx <= header.last_page {
            self.delete_page(key, idx).await?;
            idx += 1;
        }
        if entire {
            match self.engine.delete(key).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        } else {
            self.write_page(key, 0, &ListPage::empty()).await?;
            self.write_header(key, &ListHeader::new(header.page_size))
                .await?;
        }
        Ok(())
    }

    /// Copy every page and the header from `src` to `dst` (§4.3).
    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let _src_guard = self.locks.lock(&namespace::list_shared(src)).await;
        let header = self
            .read_header(src)
            .await?
            .ok_or_else(|| Error::not_found(src))?;
        let _dst_guard = self.locks.lock(&namespace::list_exclusive(dst)).await;
        let mut idx = header.first_page;
        while idx <= header.last_page {
            let page = self.read_page(src, idx).await?;
            self.write_page(dst, idx, &page).await?;
            idx += 1;
        }
        self.write_header(dst, &header).await
    }

    /// Copy then delete the source: `rename(src, dst)` (§4.3).
    pub async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.copy(src, dst).await?;
        self.delete(src, true).await
    }

    /// Shared-lock iteration over every item in order, calling `f(index,
    /// item)` for each. Returning `Ok(false)` stops iteration early;
    /// returning `Err` propagates and stops iteration (§4.3).
    pub async fn each<F>(&self, key: &str, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Value) -> Result<bool>,
    {
        let _guard = self.locks.lock(&namespace::list_shared(key)).await;
        let Some(header) = self.read_header(key).await? else {
            return Ok(());
        };
        let mut i = 0;
        let mut idx = header.first_page;
        while idx <= header.last_page {
            let page = self.read_page(key, idx).await?;
            for item in &page.items {
                if !f(i, item)? {
                    return Ok(());
                }
                i += 1;
            }
            idx += 1;
        }
        Ok(())
    }

    /// Exclusive-lock iteration that may mutate items in place. `f`
    /// receives the whole page's items and returns `Ok(true)` to keep
    /// iterating; the page is always rewritten after `f` runs, since a
    /// caller that asked for mutable access is assumed to have used it
    /// (§4.3's `listEachPageUpdate`).
    pub async fn each_page_update<F>(&self, key: &str, mut f: F) -> Result<()>
    where
        F: FnMut(i64, &mut Vec<Value>) -> Result<bool>,
    {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let Some(header) = self.read_header(key).await? else {
            return Ok(());
        };
        let mut idx = header.first_page;
        while idx <= header.last_page {
            let mut page = self.read_page(key, idx).await?;
            let keep_going = f(idx, &mut page.items)?;
            self.write_page(key, idx, &page).await?;
            if !keep_going {
                break;
            }
            idx += 1;
        }
        Ok(())
    }

    /// Find every item matching `criteria`, returning `(logical_index,
    /// item)` pairs (§4.3).
    pub async fn find(&self, key: &str, criteria: &Criteria) -> Result<Vec<(usize, Value)>> {
        let mut out = Vec::new();
        self.each(key, |i, item| {
            if matches(item, criteria) {
                out.push((i, item.clone()));
            }
            Ok(true)
        })
        .await?;
        Ok(out)
    }

    /// `find` without acquiring its own lock, for callers that already
    /// hold the list's exclusive lock and need the find and the splices
    /// that follow it to run as one atomic unit (§4.3).
    async fn find_locked(&self, key: &str, criteria: &Criteria) -> Result<Vec<(usize, Value)>> {
        let Some(header) = self.read_header(key).await? else {
            return Ok(Vec::new());
        };
        let flat = self.read_all_locked(key, &header).await?;
        Ok(flat
            .into_iter()
            .enumerate()
            .filter(|(_, item)| matches(item, criteria))
            .collect())
    }

    /// Find matching items one at a time, invoking `f` for each; `f`
    /// returning `Ok(false)` stops the search early (§4.3's
    /// `listFindEach`).
    pub async fn find_each<F>(&self, key: &str, criteria: &Criteria, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Value) -> Result<bool>,
    {
        self.each(key, |i, item| {
            if matches(item, criteria) {
                f(i, item)
            } else {
                Ok(true)
            }
        })
        .await
    }

    /// Find and remove every matching item, returning the removed items
    /// in their original order. Runs as a single exclusive-locked
    /// find-then-splice unit, so no other caller can observe or mutate
    /// the list between the search and its splices (§4.3's
    /// `listFindCut`).
    pub async fn find_cut(&self, key: &str, criteria: &Criteria) -> Result<Vec<Value>> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let hits = self.find_locked(key, criteria).await?;
        let mut removed = Vec::with_capacity(hits.len());
        // Cut from the tail first so earlier indices stay valid.
        for (idx, _) in hits.into_iter().rev() {
            let mut cut = self.splice_unlocked(key, idx, 1, Vec::new()).await?;
            removed.push(cut.remove(0));
        }
        removed.reverse();
        Ok(removed)
    }

    /// Find and replace every matching item with `replacement`. Runs as
    /// a single exclusive-locked find-then-splice unit (§4.3's
    /// `listFindReplace`).
    pub async fn find_replace(&self, key: &str, criteria: &Criteria, replacement: Value) -> Result<usize> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let hits = self.find_locked(key, criteria).await?;
        let count = hits.len();
        for (idx, _) in hits.into_iter().rev() {
            self.splice_unlocked(key, idx, 1, vec![replacement.clone()])
                .await?;
        }
        Ok(count)
    }

    /// Find every matching item and apply `update` to its JSON object
    /// fields, writing the merged result back. Numeric deltas encoded as
    /// `"+N"`/`"-N"` strings add to (or subtract from) the existing
    /// numeric field instead of overwriting it. Runs as a single
    /// exclusive-locked find-then-splice unit (§4.3's `listFindUpdate`).
    pub async fn find_update(
        &self,
        key: &str,
        criteria: &Criteria,
        update: &serde_json::Map<String, Value>,
    ) -> Result<usize> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let hits = self.find_locked(key, criteria).await?;
        let count = hits.len();
        for (idx, mut item) in hits.into_iter().rev() {
            apply_update(&mut item, update);
            self.splice_unlocked(key, idx, 1, vec![item]).await?;
        }
        Ok(count)
    }

    /// Per-item counterpart to `each_page_update`: exclusive-lock
    /// iteration where `f` may replace or delete each item individually,
    /// rather than rewrite the whole page it lives on. Only pages whose
    /// contents actually changed are written back (§4.3's
    /// `listEachUpdate`).
    pub async fn each_update<F>(&self, key: &str, mut f: F) -> Result<()>
    where
        F: FnMut(usize, &Value) -> Result<ItemUpdate>,
    {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let Some(mut header) = self.read_header(key).await? else {
            return Ok(());
        };
        let mut i = 0;
        let mut idx = header.first_page;
        let mut removed = 0;
        while idx <= header.last_page {
            let mut page = self.read_page(key, idx).await?;
            let mut changed = false;
            let mut kept = Vec::with_capacity(page.items.len());
            for item in page.items.drain(..) {
                match f(i, &item)? {
                    ItemUpdate::Keep => kept.push(item),
                    ItemUpdate::Replace(new_value) => {
                        changed = true;
                        kept.push(new_value);
                    }
                    ItemUpdate::Delete => {
                        changed = true;
                        removed += 1;
                    }
                }
                i += 1;
            }
            if changed {
                page.items = kept;
                self.write_page(key, idx, &page).await?;
            }
            idx += 1;
        }
        if removed > 0 {
            header.length -= removed;
            self.write_header(key, &header).await?;
        }
        Ok(())
    }

    /// Insert `item` at the first position where `item` sorts before the
    /// existing element there, using `key_field` and `ascending`;
    /// otherwise append at the tail (§4.3's `listInsertSorted`).
    pub async fn insert_sorted(&self, key: &str, item: Value, key_field: &str, ascending: bool) -> Result<usize> {
        let _guard = self.locks.lock(&namespace::list_exclusive(key)).await;
        let header = self.header_or_create(key).await?;
        let flat = self.read_all_locked(key, &header).await?;
        let target = extract_sort_key(&item, key_field);
        let mut insert_at = flat.len();
        for (i, existing) in flat.iter().enumerate() {
            let other = extract_sort_key(existing, key_field);
            let less = compare_json(&target, &other);
            let goes_before = if ascending { less < 0 } else { less > 0 };
            if goes_before {
                insert_at = i;
                break;
            }
        }
        drop(flat);
        self.splice_unlocked(key, insert_at, 0, vec![item]).await?;
        Ok(insert_at)
    }

    /// `splice` without re-acquiring the exclusive lock, for callers
    /// (like `insert_sorted`) that already hold it.
    async fn splice_unlocked(&self, key: &str, idx: usize, cut_len: usize, new_items: Vec<Value>) -> Result<Vec<Value>> {
        let mut header = self
            .read_header(key)
            .await?
            .ok_or_else(|| Error::not_found(key))?;
        let start = idx.min(header.length);
        let cut = cut_len.min(header.length.saturating_sub(start));
        let mut flat = self.read_all_locked(key, &header).await?;
        let removed: Vec<Value> = flat.splice(start..start + cut, new_items).collect();
        let anchor = header.first_page;
        let old_last = header.last_page;
        let new_pages = chunk_with_trailing_remainder(&flat, header.page_size);
        for (offset, chunk) in new_pages.iter().enumerate() {
            let page = ListPage {
                kind: Default::default(),
                items: chunk.clone(),
            };
            self.write_page(key, anchor + offset as i64, &page).await?;
        }
        let new_last = anchor + new_pages.len() as i64 - 1;
        for stale in (new_last + 1)..=old_last {
            self.delete_page(key, stale).await?;
        }
        if new_last < old_last {
            tracing::debug!(key, freed = old_last - new_last, "list splice freed trailing pages");
        }
        header.length = flat.len();
        header.first_page = anchor;
        header.last_page = new_last;
        self.write_header(key, &header).await?;
        Ok(removed)
    }
}

/// Apply a shallow field-by-field update. A string value of the form
/// `"+N"`/`"-N"` against a numeric target field adds/subtracts `N`
/// instead of overwriting (§4.3).
fn apply_update(item: &mut Value, update: &serde_json::Map<String, Value>) {
    let Some(obj) = item.as_object_mut() else {
        return;
    };
    for (field, new_value) in update {
        if let Some(delta) = new_value.as_str().and_then(parse_delta) {
            let current = obj.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
            obj.insert(field.clone(), serde_json::json!(current + delta));
        } else {
            obj.insert(field.clone(), new_value.clone());
        }
    }
}

fn parse_delta(s: &str) -> Option<f64> {
    if let Some(rest) = s.strip_prefix('+') {
        rest.parse::<f64>().ok()
    } else if s.starts_with('-') {
        s.parse::<f64>().ok()
    } else {
        None
    }
}

fn extract_sort_key(item: &Value, field: &str) -> Value {
    item.get(field).cloned().unwrap_or(Value::Null)
}

/// Three-way compare of two JSON scalars for sorting purposes: numbers
/// compare numerically, everything else compares as strings.
fn compare_json(a: &Value, b: &Value) -> i32 {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).map(|o| o as i32).unwrap_or(0);
    }
    let sa = a.as_str().map(String::from).unwrap_or_else(|| a.to_string());
    let sb = b.as_str().map(String::from).unwrap_or_else(|| b.to_string());
    match sa.cmp(&sb) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Chunk `items` into `page_size`-sized groups, left to right, with the
/// final group holding the remainder (possibly empty if `items` is
/// empty, to guarantee at least one page exists).
fn chunk_with_trailing_remainder(items: &[Value], page_size: usize) -> Vec<Vec<Value>> {
    if items.is_empty() {
        return vec![Vec::new()];
    }
    items
        .chunks(page_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_engine::MemoryEngine;
    use serde_json::json;

    fn store() -> ListStore {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        ListStore::new(engine, Arc::new(LockManager::new()))
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let s = store();
        let h1 = s.create("mylist", 10).await.unwrap();
        let h2 = s.create("mylist", 999).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn push_pop_round_trip() {
        let s = store();
        s.create("mylist", 3).await.unwrap();
        s.push("mylist", vec![json!(1), json!(2), json!(3), json!(4)])
            .await
            .unwrap();
        assert_eq!(s.pop("mylist").await.unwrap(), Some(json!(4)));
        assert_eq!(s.get("mylist", 0, 0).await.unwrap(), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn unshift_and_shift() {
        let s = store();
        s.create("mylist", 3).await.unwrap();
        s.unshift("mylist", vec![json!(1), json!(2)]).await.unwrap();
        s.unshift("mylist", vec![json!(-1), json!(0)]).await.unwrap();
        assert_eq!(
            s.get("mylist", 0, 0).await.unwrap(),
            vec![json!(-1), json!(0), json!(1), json!(2)]
        );
        assert_eq!(s.shift("mylist").await.unwrap(), Some(json!(-1)));
    }

    #[tokio::test]
    async fn negative_index_counts_from_tail() {
        let s = store();
        s.create("mylist", 50).await.unwrap();
        s.push("mylist", (1..=5).map(|i| json!(i)).collect()).await.unwrap();
        assert_eq!(s.get("mylist", -2, 0).await.unwrap(), vec![json!(4), json!(5)]);
    }

    #[tokio::test]
    async fn splice_wrap_around_matches_worked_example() {
        // §8 scenario 1.
        let s = store();
        s.create("mylist", 3).await.unwrap();
        s.push("mylist", (1..=7).map(|i| json!(i)).collect()).await.unwrap();
        let cut = s.splice("mylist", 2, 3, vec![json!(9), json!(10)]).await.unwrap();
        assert_eq!(cut, vec![json!(3), json!(4), json!(5)]);
        assert_eq!(
            s.get("mylist", 0, 0).await.unwrap(),
            vec![json!(1), json!(2), json!(9), json!(10), json!(6), json!(7)]
        );
    }

    #[tokio::test]
    async fn splice_law_holds_for_sampled_params() {
        let s = store();
        s.create("mylist", 4).await.unwrap();
        let original: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        s.push("mylist", original.clone()).await.unwrap();

        for idx in 0..=original.len() {
            for cut in 0..=(original.len() - idx) {
                let s2 = store();
                s2.create("mylist", 4).await.unwrap();
                s2.push("mylist", original.clone()).await.unwrap();
                let ins = vec![json!("x"), json!("y")];
                let removed = s2.splice("mylist", idx as i64, cut, ins.clone()).await.unwrap();
                assert_eq!(removed, original[idx..idx + cut].to_vec());
                let mut expected = original[0..idx].to_vec();
                expected.extend(ins);
                expected.extend(original[idx + cut..].to_vec());
                assert_eq!(s2.get("mylist", 0, 0).await.unwrap(), expected);
            }
        }
    }

    #[tokio::test]
    async fn delete_entire_removes_header() {
        let s = store();
        s.create("mylist", 3).await.unwrap();
        s.push("mylist", vec![json!(1)]).await.unwrap();
        s.delete("mylist", true).await.unwrap();
        assert_eq!(s.read_header("mylist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_and_find_cut() {
        let s = store();
        s.create("mylist", 50).await.unwrap();
        s.push(
            "mylist",
            vec![
                json!({"name": "a", "active": true}),
                json!({"name": "b", "active": false}),
                json!({"name": "c", "active": true}),
            ],
        )
        .await
        .unwrap();
        let mut criteria = Criteria::new();
        criteria.insert("active".into(), crate::criteria::Criterion::Eq(json!(true)));
        let hits = s.find("mylist", &criteria).await.unwrap();
        assert_eq!(hits.len(), 2);
        let cut = s.find_cut("mylist", &criteria).await.unwrap();
        assert_eq!(cut.len(), 2);
        assert_eq!(s.get("mylist", 0, 0).await.unwrap(), vec![json!({"name": "b", "active": false})]);
    }

    #[tokio::test]
    async fn find_update_applies_numeric_delta() {
        let s = store();
        s.create("mylist", 50).await.unwrap();
        s.push("mylist", vec![json!({"name": "a", "score": 10})]).await.unwrap();
        let mut criteria = Criteria::new();
        criteria.insert("name".into(), crate::criteria::Criterion::Eq(json!("a")));
        let mut update = serde_json::Map::new();
        update.insert("score".into(), json!("+5"));
        s.find_update("mylist", &criteria, &update).await.unwrap();
        assert_eq!(s.get("mylist", 0, 0).await.unwrap(), vec![json!({"name": "a", "score": 15.0})]);
    }

    #[tokio::test]
    async fn each_update_replaces_and_deletes_individual_items() {
        let s = store();
        s.create("mylist", 2).await.unwrap();
        s.push("mylist", (1..=5).map(|i| json!(i)).collect()).await.unwrap();

        s.each_update("mylist", |i, item| {
            let n = item.as_i64().unwrap();
            Ok(if n == 2 {
                ItemUpdate::Delete
            } else if i == 4 {
                ItemUpdate::Replace(json!(50))
            } else {
                ItemUpdate::Keep
            })
        })
        .await
        .unwrap();

        assert_eq!(
            s.get("mylist", 0, 0).await.unwrap(),
            vec![json!(1), json!(3), json!(4), json!(50)]
        );
    }

    #[tokio::test]
    async fn insert_sorted_places_item_in_order() {
        let s = store();
        s.create("mylist", 50).await.unwrap();
        s.push("mylist", vec![json!({"v": 1}), json!({"v": 3}), json!({"v": 5})])
            .await
            .unwrap();
        s.insert_sorted("mylist", json!({"v": 4}), "v", true).await.unwrap();
        let got = s.get("mylist", 0, 0).await.unwrap();
        let values: Vec<i64> = got.iter().map(|v| v["v"].as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 3, 4, 5]);
    }
}
