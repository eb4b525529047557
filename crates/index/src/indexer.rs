//! The indexer itself (§4.5): writes the per-record blob and the word/
//! id/summary/sort hashes on `index_record`, and evaluates the three
//! query forms against them on `search`.

use crate::field::{FieldDef, FieldType, IndexConfig};
use crate::query::{Mode, Query, RangeOp};
use crate::tokenize::{self, WordOffsets};
use kvlayer_core::{Engine, Error, Result};
use kvlayer_hash::HashStore;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// `field_id -> word -> offsets`, the shape of both the per-record blob
/// and the synthetic index `search_single` builds for one record
/// (§3.5, §4.5.6).
pub type FieldIndex = BTreeMap<String, BTreeMap<String, Vec<usize>>>;

#[derive(Clone)]
pub struct Indexer {
    engine: Arc<dyn Engine>,
    hash: HashStore,
}

impl Indexer {
    pub fn new(engine: Arc<dyn Engine>, hash: HashStore) -> Self {
        Indexer { engine, hash }
    }

    fn record_id(record: &Value) -> Result<String> {
        record
            .get("id")
            .and_then(|v| v.as_str().map(String::from).or_else(|| Some(v.to_string())))
            .ok_or_else(|| Error::InvalidInput("record has no 'id' field to index".into()))
    }

    /// Tokenize every field of `record` per its field type (§4.5.1–3),
    /// without touching storage. Shared by `index_record` and
    /// `search_single`.
    fn build_field_index(config: &IndexConfig, record: &Value) -> Result<FieldIndex> {
        let mut out = FieldIndex::new();
        for field in &config.fields {
            let Some(value) = record.pointer(&field.pointer()) else {
                continue;
            };
            let tokens: WordOffsets = match &field.field_type {
                FieldType::Word {
                    min_word_length,
                    max_word_length,
                    use_remove_words,
                } => {
                    let Some(text) = value.as_str() else { continue };
                    tokenize::word_tokens(
                        text,
                        *min_word_length,
                        *max_word_length,
                        *use_remove_words,
                        &config.remove_words,
                    )
                }
                FieldType::Date => {
                    let date = tokenize::parse_date_value(value)?;
                    tokenize::date_tokens(date)
                }
                FieldType::Number { multiply, divide } => {
                    let Some(n) = value.as_f64() else { continue };
                    tokenize::number_tokens(n, *multiply, *divide)
                }
            };
            let entry: &mut BTreeMap<String, Vec<usize>> = out.entry(field.id.clone()).or_default();
            for (word, offset) in tokens {
                entry.entry(word).or_default().push(offset);
            }
        }
        Ok(out)
    }

    /// Index `record` under `config` (§3.5): writes the per-record blob,
    /// the primary id hash, per-field word hashes, per-field summaries
    /// for `master_list` fields, and per-sorter sort hashes.
    pub async fn index_record(&self, config: &IndexConfig, record: &Value) -> Result<()> {
        let record_id = Self::record_id(record)?;
        let field_index = Self::build_field_index(config, record)?;

        let blob = serde_json::to_vec(&field_index).expect("FieldIndex always serializes");
        self.engine.put(&config.data_key(&record_id), &blob).await?;
        self.hash.put(&config.id_hash_key(), &record_id, json!(1)).await?;

        for field in &config.fields {
            let Some(words) = field_index.get(&field.id) else {
                continue;
            };
            for (word, offsets) in words {
                let csv = offsets.iter().map(|o| o.to_string()).collect::<Vec<_>>().join(",");
                self.hash
                    .put(&config.word_hash_key(&field.id, word), &record_id, json!(csv))
                    .await?;
            }
            if field.effective_master_list() {
                self.bump_summary(config, &field.id, words.keys(), 1).await?;
            }
        }

        for sorter in &config.sorters {
            if let Some(value) = record.pointer(&sorter.pointer()) {
                self.hash
                    .put(&config.sort_hash_key(&sorter.id), &record_id, value.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove everything `index_record` wrote for `record_id` (not named
    /// in §4.5's operation list directly, but required to keep the
    /// index consistent once a record is deleted from the Store).
    pub async fn remove_record(&self, config: &IndexConfig, record_id: &str) -> Result<()> {
        eprintln!("DBG remove_record start");
        let data_key = config.data_key(record_id);
        let field_index: FieldIndex = match self.engine.get(&data_key).await {
            Ok((bytes, _)) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::ParseError(format!("corrupt index blob at '{data_key}': {e}")))?,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        eprintln!("DBG remove_record got field_index");

        for field in &config.fields {
            let Some(words) = field_index.get(&field.id) else {
                continue;
            };
            for word in words.keys() {
                eprintln!("DBG deleting word hash for {word}");
                if let Err(e) = self.hash.delete(&config.word_hash_key(&field.id, word), record_id).await {
                    if !e.is_not_found() {
                        tracing::warn!(record_id, field = field.id.as_str(), error = %e, "failed to remove word-hash entry during unindex");
                    }
                }
                eprintln!("DBG deleted word hash for {word}");
            }
            if field.effective_master_list() {
                eprintln!("DBG bump_summary start for {}", field.id);
                self.bump_summary(config, &field.id, words.keys(), -1).await?;
                eprintln!("DBG bump_summary done for {}", field.id);
            }
        }
        for sorter in &config.sorters {
            eprintln!("DBG deleting sort hash for {}", sorter.id);
            let _ = self.hash.delete(&config.sort_hash_key(&sorter.id), record_id).await;
        }
        eprintln!("DBG deleting id hash");
        let _ = self.hash.delete(&config.id_hash_key(), record_id).await;
        eprintln!("DBG deleted id hash");
        self.engine.delete(&data_key).await.ok();
        eprintln!("DBG remove_record done");
        Ok(())
    }

    async fn bump_summary<'w>(
        &self,
        config: &IndexConfig,
        field_id: &str,
        words: impl Iterator<Item = &'w String>,
        delta: i64,
    ) -> Result<()> {
        let key = config.summary_key(field_id);
        let mut summary = self.read_summary_raw(&key).await?;
        let values = summary
            .entry("values".to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()))
            .as_object_mut()
            .expect("values is always an object");
        for word in words {
            let count = values.get(word).and_then(|v| v.as_i64()).unwrap_or(0) + delta;
            if count <= 0 {
                values.remove(word);
            } else {
                values.insert(word.clone(), json!(count));
            }
        }
        summary.insert("id".to_string(), json!(field_id));
        let bytes = serde_json::to_vec(&Value::Object(summary)).expect("summary always serializes");
        self.engine.put(&key, &bytes).await
    }

    async fn read_summary_raw(&self, key: &str) -> Result<serde_json::Map<String, Value>> {
        match self.engine.get(key).await {
            Ok((bytes, _)) => serde_json::from_slice::<Value>(&bytes)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .ok_or_else(|| Error::ParseError(format!("corrupt summary record at '{key}'"))),
            Err(e) if e.is_not_found() => Ok(serde_json::Map::new()),
            Err(e) => Err(e),
        }
    }

    /// Evaluate `query` against the persisted index, returning matching
    /// record ids in ascending order (§4.5.5).
    pub async fn search(&self, config: &IndexConfig, query: &Query) -> Result<Vec<String>> {
        let set = self.eval_clause(config, query).await?;
        let mut ids: Vec<String> = set.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    /// Evaluate `clause`, honoring its own `negate` flag by complementing
    /// against every indexed id when set (§4.5.5). This is the entry
    /// point for a clause reached standalone — at the top of `search`, or
    /// a lone clause a PxQL single-clause group collapsed down to —
    /// rather than as one sibling inside an enclosing group's merge,
    /// which applies negation itself via `eval_group`.
    fn eval_clause<'a>(
        &'a self,
        config: &'a IndexConfig,
        clause: &'a Query,
    ) -> Pin<Box<dyn Future<Output = Result<HashSet<String>>> + Send + 'a>> {
        Box::pin(async move {
            let ids = self.eval_positive(config, clause).await?;
            if clause.is_negated() {
                let universe = self.all_ids(config).await?;
                Ok(universe.difference(&ids).cloned().collect())
            } else {
                Ok(ids)
            }
        })
    }

    /// Evaluate `clause`'s own match set, ignoring its `negate` flag.
    fn eval_positive<'a>(
        &'a self,
        config: &'a IndexConfig,
        clause: &'a Query,
    ) -> Pin<Box<dyn Future<Output = Result<HashSet<String>>> + Send + 'a>> {
        Box::pin(async move {
            match clause {
                Query::Group { mode, clauses, .. } => self.eval_group(config, *mode, clauses).await,
                Query::Word { field, word, .. } => self.word_ids(config, field, word).await,
                Query::Phrase { field, words, .. } => self.phrase_ids(config, field, words).await,
                Query::Range { field, op, value, .. } => self.range_ids(config, field, *op, value).await,
            }
        })
    }

    /// Every record id ever indexed under `config`, the universe a
    /// top-level negated clause complements against.
    async fn all_ids(&self, config: &IndexConfig) -> Result<HashSet<String>> {
        match self.hash.get_all(&config.id_hash_key()).await {
            Ok(map) => Ok(map.into_keys().collect()),
            Err(_) => Ok(HashSet::new()),
        }
    }

    /// Merge sub-group results first, then positive word tasks, then
    /// negative tasks; the first task in the merged order always runs as
    /// `or` into an empty accumulator regardless of `mode` (§4.5.5). Each
    /// sibling's own negation is applied here via subtraction rather than
    /// through `eval_clause`, so a negated sibling's positive set (not
    /// its own universe complement) is what gets merged in.
    async fn eval_group(&self, config: &IndexConfig, mode: Mode, clauses: &[Query]) -> Result<HashSet<String>> {
        let mut ordered: Vec<&Query> = Vec::new();
        ordered.extend(clauses.iter().filter(|c| c.is_group()));
        ordered.extend(clauses.iter().filter(|c| !c.is_group() && !c.is_negated()));
        ordered.extend(clauses.iter().filter(|c| !c.is_group() && c.is_negated()));

        let mut acc: HashSet<String> = HashSet::new();
        for (i, clause) in ordered.into_iter().enumerate() {
            let ids = self.eval_positive(config, clause).await?;
            if i == 0 {
                acc = ids;
                continue;
            }
            if clause.is_negated() {
                for id in &ids {
                    acc.remove(id);
                }
            } else {
                match mode {
                    Mode::Or => acc.extend(ids),
                    Mode::And => acc = acc.intersection(&ids).cloned().collect(),
                }
            }
        }
        Ok(acc)
    }

    async fn word_ids(&self, config: &IndexConfig, field: &str, word: &str) -> Result<HashSet<String>> {
        let key = config.word_hash_key(field, word);
        match self.hash.get_all(&key).await {
            Ok(map) => Ok(map.into_keys().collect()),
            Err(_) => Ok(HashSet::new()),
        }
    }

    async fn word_offsets(&self, config: &IndexConfig, field: &str, word: &str, record_id: &str) -> Result<Vec<usize>> {
        let key = config.word_hash_key(field, word);
        match self.hash.get(&key, record_id).await {
            Ok(v) => Ok(parse_offsets(v.as_str().unwrap_or(""))),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Literal-phrase matching: intersect candidate ids across every
    /// word, then verify that each candidate has a chain of offsets one
    /// apart, in order (§4.5.5).
    async fn phrase_ids(&self, config: &IndexConfig, field: &str, words: &[String]) -> Result<HashSet<String>> {
        if words.is_empty() {
            return Ok(HashSet::new());
        }
        let mut candidates = self.word_ids(config, field, &words[0]).await?;
        for w in &words[1..] {
            let next = self.word_ids(config, field, w).await?;
            candidates = candidates.intersection(&next).cloned().collect();
        }

        let mut verified = HashSet::new();
        'candidate: for id in candidates {
            let mut allowed: Option<Vec<usize>> = None;
            for w in words {
                let offsets = self.word_offsets(config, field, w, &id).await?;
                let next_allowed: Vec<usize> = match &allowed {
                    None => offsets,
                    Some(prev) => offsets
                        .into_iter()
                        .filter(|o| o.checked_sub(1).is_some_and(|p| prev.contains(&p)))
                        .collect(),
                };
                if next_allowed.is_empty() {
                    continue 'candidate;
                }
                allowed = Some(next_allowed);
            }
            verified.insert(id);
        }
        Ok(verified)
    }

    /// Range queries over a date/number field's summary master list
    /// (§4.5.5): every bucket tag satisfying `op` is OR'd together.
    async fn range_ids(&self, config: &IndexConfig, field_id: &str, op: RangeOp, value: &str) -> Result<HashSet<String>> {
        let field = config
            .field(field_id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown field '{field_id}'")))?;
        let summary = self.read_summary_raw(&config.summary_key(field_id)).await?;
        let values = summary.get("values").and_then(|v| v.as_object());
        let mut out = HashSet::new();
        if let Some(values) = values {
            for token in values.keys() {
                if token_matches(field, token, op, value).unwrap_or(false) {
                    out.extend(self.word_ids(config, field_id, token).await?);
                }
            }
        }
        Ok(out)
    }

    /// Reconstruct a synthetic single-record index and evaluate `query`
    /// against it without touching storage (§4.5.6).
    pub fn search_single(config: &IndexConfig, query: &Query, record: &Value) -> Result<bool> {
        let field_index = Self::build_field_index(config, record)?;
        Ok(eval_single(config, query, &field_index))
    }

    /// Read each surviving record's sort value and order the id list
    /// (§4.5.7). `direction` is `1` for ascending, `-1` for descending.
    pub async fn sort_records(&self, config: &IndexConfig, ids: Vec<String>, sorter_id: &str, direction: i32) -> Result<Vec<String>> {
        let key = config.sort_hash_key(sorter_id);
        let mut pairs = Vec::with_capacity(ids.len());
        for id in ids {
            let value = self.hash.get(&key, &id).await.unwrap_or(Value::Null);
            pairs.push((id, value));
        }
        pairs.sort_by(|a, b| {
            let ord = compare_json(&a.1, &b.1);
            if direction < 0 {
                ord.reverse()
            } else {
                ord
            }
        });
        Ok(pairs.into_iter().map(|(id, _)| id).collect())
    }
}

fn parse_offsets(csv: &str) -> Vec<usize> {
    if csv.is_empty() {
        return Vec::new();
    }
    csv.split(',').filter_map(|s| s.parse().ok()).collect()
}

fn compare_json(a: &Value, b: &Value) -> std::cmp::Ordering {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal);
    }
    let sa = a.as_str().map(String::from).unwrap_or_else(|| a.to_string());
    let sb = b.as_str().map(String::from).unwrap_or_else(|| b.to_string());
    sa.cmp(&sb)
}

/// Whether a summary bucket tag `token` satisfies `op` against query
/// literal `value`, for the field's own type. `None` means the token
/// granularity doesn't apply to range comparison (word fields never do;
/// date fields only compare day-granularity tokens; number fields skip
/// the `H`/`T` bucket tags themselves).
fn token_matches(field: &FieldDef, token: &str, op: RangeOp, value: &str) -> Option<bool> {
    match &field.field_type {
        FieldType::Word { .. } => None,
        FieldType::Date => {
            if token.len() != 10 {
                return None;
            }
            let today = chrono::Utc::now().date_naive();
            let normalized = tokenize::normalize_date_query(value, today).ok()?;
            Some(compare_ord(token.cmp(&normalized), op))
        }
        FieldType::Number { .. } => {
            if token.starts_with('H') || token.starts_with('T') {
                return None;
            }
            let tv: f64 = if let Some(rest) = token.strip_prefix('N') {
                -rest.parse::<f64>().ok()?
            } else {
                token.parse().ok()?
            };
            let wv: f64 = value.parse().ok()?;
            Some(compare_ord(tv.partial_cmp(&wv)?, op))
        }
    }
}

fn compare_ord(ord: std::cmp::Ordering, op: RangeOp) -> bool {
    use std::cmp::Ordering::*;
    match op {
        RangeOp::Eq | RangeOp::Match => ord == Equal,
        RangeOp::Ne | RangeOp::NotMatch => ord != Equal,
        RangeOp::Lt => ord == Less,
        RangeOp::Le => ord != Greater,
        RangeOp::Gt => ord == Greater,
        RangeOp::Ge => ord != Less,
    }
}

/// `search_single`'s evaluator: the same group-ordering/merge algorithm
/// as `eval_group`/`eval_clause`, but reduced to booleans since there is
/// exactly one candidate record (§4.5.6). `query`'s own `negate` is
/// honored here, the single-record equivalent of complementing against
/// the full id universe (there's only one record, so "not positive" is
/// just the complement of the boolean).
fn eval_single(config: &IndexConfig, query: &Query, field_index: &FieldIndex) -> bool {
    let hit = eval_single_positive(config, query, field_index);
    if query.is_negated() {
        !hit
    } else {
        hit
    }
}

fn eval_single_positive(config: &IndexConfig, query: &Query, field_index: &FieldIndex) -> bool {
    match query {
        Query::Group { mode, clauses, .. } => eval_single_group(config, *mode, clauses, field_index),
        other => eval_single_leaf(config, other, field_index),
    }
}

fn eval_single_group(config: &IndexConfig, mode: Mode, clauses: &[Query], field_index: &FieldIndex) -> bool {
    let mut ordered: Vec<&Query> = Vec::new();
    ordered.extend(clauses.iter().filter(|c| c.is_group()));
    ordered.extend(clauses.iter().filter(|c| !c.is_group() && !c.is_negated()));
    ordered.extend(clauses.iter().filter(|c| !c.is_group() && c.is_negated()));

    let mut acc = false;
    for (i, clause) in ordered.into_iter().enumerate() {
        let hit = eval_single_positive(config, clause, field_index);
        if i == 0 {
            acc = hit;
            continue;
        }
        acc = if clause.is_negated() {
            acc && !hit
        } else {
            match mode {
                Mode::Or => acc || hit,
                Mode::And => acc && hit,
            }
        };
    }
    acc
}

fn eval_single_leaf(config: &IndexConfig, clause: &Query, field_index: &FieldIndex) -> bool {
    match clause {
        Query::Group { .. } => unreachable!("groups are handled by eval_single"),
        Query::Word { field, word, .. } => field_index.get(field).is_some_and(|w| w.contains_key(word)),
        Query::Phrase { field, words, .. } => {
            let Some(field_words) = field_index.get(field) else { return false };
            let mut allowed: Option<Vec<usize>> = None;
            for w in words {
                let Some(offsets) = field_words.get(w) else { return false };
                let next_allowed: Vec<usize> = match &allowed {
                    None => offsets.clone(),
                    Some(prev) => offsets
                        .iter()
                        .copied()
                        .filter(|o| o.checked_sub(1).is_some_and(|p| prev.contains(&p)))
                        .collect(),
                };
                if next_allowed.is_empty() {
                    return false;
                }
                allowed = Some(next_allowed);
            }
            true
        }
        Query::Range { field: field_id, op, value, .. } => {
            let Some(field) = config.field(field_id) else { return false };
            let Some(words) = field_index.get(field_id) else { return false };
            words.keys().any(|token| token_matches(field, token, *op, value).unwrap_or(false))
        }
    }
}
