//! The semantic record shapes that distinguish container internals from
//! opaque application records (§3.2–§3.6).
//!
//! All of these are plain JSON records at the engine boundary; the `type`
//! field is what lets the Store tell a list header from a hash leaf from
//! an application record with no recognized type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The header record for a list, stored at the list's own key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListHeader {
    #[serde(rename = "type")]
    pub kind: ListHeaderKind,
    pub page_size: usize,
    pub length: usize,
    pub first_page: i64,
    pub last_page: i64,
}

/// Marker enum that (de)serializes to/from the literal string `"list"`,
/// giving the header record a recognizable `type` tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ListHeaderKind {
    #[serde(rename = "list")]
    List,
}

impl ListHeader {
    pub fn new(page_size: usize) -> Self {
        ListHeader {
            kind: ListHeaderKind::List,
            page_size,
            length: 0,
            first_page: 0,
            last_page: 0,
        }
    }
}

/// A single page of list items, stored at `K/<page_idx>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ListPage {
    #[serde(rename = "type")]
    pub kind: ListPageKind,
    pub items: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ListPageKind {
    #[default]
    #[serde(rename = "list_page")]
    ListPage,
}

impl ListPage {
    pub fn empty() -> Self {
        ListPage {
            kind: ListPageKind::ListPage,
            items: Vec::new(),
        }
    }
}

/// The header record for a hash, stored at the hash's own key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HashHeader {
    #[serde(rename = "type")]
    pub kind: HashHeaderKind,
    pub page_size: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HashHeaderKind {
    #[serde(rename = "hash")]
    Hash,
}

impl HashHeader {
    pub fn new(page_size: usize) -> Self {
        HashHeader {
            kind: HashHeaderKind::Hash,
            page_size,
            length: 0,
        }
    }
}

/// A hash leaf: `{ type: hash_page, length, items: { key: value } }`.
///
/// Items are kept in a `BTreeMap` rather than any type that walks a
/// language prototype chain (§3.4's "lookups must not consult any
/// prototype chain" — trivially true of a Rust map, but the field is
/// still plain data so any key string, including ones that would collide
/// with object-intrinsic names in other languages, round-trips exactly).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HashLeaf {
    #[serde(rename = "type")]
    pub kind: HashLeafKind,
    pub length: usize,
    pub items: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HashLeafKind {
    #[default]
    #[serde(rename = "hash_page")]
    HashPage,
}

impl HashLeaf {
    pub fn empty() -> Self {
        HashLeaf {
            kind: HashLeafKind::HashPage,
            length: 0,
            items: BTreeMap::new(),
        }
    }
}

/// A hash inner node: `{ type: hash_index }`. Its (up to 16) children
/// live at sibling keys `<this>/<nibble>` and are not embedded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HashIndexNode {
    #[serde(rename = "type")]
    pub kind: HashIndexKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HashIndexKind {
    #[default]
    #[serde(rename = "hash_index")]
    HashIndex,
}

/// A record's discriminant, read before deciding how to interpret it
/// (§4.2's `runMaintenance`, which dispatches on `type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    List,
    ListPage,
    Hash,
    HashIndex,
    HashPage,
    Opaque,
}

/// Inspect a raw JSON record's `type` field without fully deserializing
/// it into one of the typed records above.
pub fn record_kind(value: &serde_json::Value) -> RecordKind {
    match value.get("type").and_then(|t| t.as_str()) {
        Some("list") => RecordKind::List,
        Some("list_page") => RecordKind::ListPage,
        Some("hash") => RecordKind::Hash,
        Some("hash_index") => RecordKind::HashIndex,
        Some("hash_page") => RecordKind::HashPage,
        _ => RecordKind::Opaque,
    }
}

/// Per-transaction header line written at the top of a rollback log
/// (§3.6, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub id: String,
    pub path: String,
    pub date: i64,
    pub pid: u32,
}

/// A single pre-image line in a rollback log: the engine's state for
/// `key` at the moment the transaction began, or `None` if the key was
/// absent (serialized as JSON `0` per §3.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub key: String,
    pub value: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_header_round_trips_with_type_tag() {
        let h = ListHeader::new(50);
        let s = serde_json::to_string(&h).unwrap();
        assert!(s.contains("\"type\":\"list\""));
        let back: ListHeader = serde_json::from_str(&s).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn record_kind_detects_each_tag() {
        assert_eq!(
            record_kind(&serde_json::json!({"type": "list"})),
            RecordKind::List
        );
        assert_eq!(
            record_kind(&serde_json::json!({"type": "hash_page"})),
            RecordKind::HashPage
        );
        assert_eq!(
            record_kind(&serde_json::json!({"foo": "bar"})),
            RecordKind::Opaque
        );
    }

    #[test]
    fn hash_leaf_keeps_dangerous_property_names_verbatim() {
        let mut leaf = HashLeaf::empty();
        leaf.items
            .insert("__proto__".to_string(), serde_json::json!("poison"));
        leaf.items
            .insert("constructor".to_string(), serde_json::json!(1));
        assert_eq!(leaf.items.get("__proto__").unwrap(), "poison");
        assert_eq!(leaf.items.len(), 2);
    }
}
