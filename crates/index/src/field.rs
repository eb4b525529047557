//! Field and sorter definitions for an index configuration (§3.5).

use std::collections::HashSet;

/// How a field's source value is tokenized before indexing.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// The default pipeline (§4.5.1): unidecode, lower-case, tokenize,
    /// length-filter, optional stopword removal, Porter stem.
    Word {
        min_word_length: usize,
        max_word_length: usize,
        use_remove_words: bool,
    },
    /// `YYYY_MM_DD`/`YYYY_MM`/`YYYY` tokens (§4.5.2). Always `master_list`.
    Date,
    /// Exact/hundred-bucket/thousand-bucket tokens (§4.5.3). Always
    /// `master_list`.
    Number { multiply: f64, divide: f64 },
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType::Word {
            min_word_length: 1,
            max_word_length: 64,
            use_remove_words: false,
        }
    }
}

/// One indexed field: where its value comes from in the record, how it's
/// tokenized, and whether a summary master list is kept for range
/// queries (§3.5).
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub id: String,
    /// A JSON-pointer-style path into the record, e.g. `"/title"` or
    /// `"title"` (a leading `/` is inserted if missing).
    pub source: String,
    pub field_type: FieldType,
    pub master_list: bool,
}

impl FieldDef {
    pub fn word(id: impl Into<String>, source: impl Into<String>) -> Self {
        FieldDef {
            id: id.into(),
            source: source.into(),
            field_type: FieldType::default(),
            master_list: false,
        }
    }

    pub fn date(id: impl Into<String>, source: impl Into<String>) -> Self {
        FieldDef {
            id: id.into(),
            source: source.into(),
            field_type: FieldType::Date,
            master_list: true,
        }
    }

    pub fn number(id: impl Into<String>, source: impl Into<String>) -> Self {
        FieldDef {
            id: id.into(),
            source: source.into(),
            field_type: FieldType::Number {
                multiply: 1.0,
                divide: 1.0,
            },
            master_list: true,
        }
    }

    pub fn with_master_list(mut self, on: bool) -> Self {
        self.master_list = on;
        self
    }

    /// Force `master_list` on for date/number fields regardless of what
    /// the caller asked for (§4.5.2, §4.5.3).
    pub(crate) fn effective_master_list(&self) -> bool {
        match self.field_type {
            FieldType::Word { .. } => self.master_list,
            FieldType::Date | FieldType::Number { .. } => true,
        }
    }

    pub(crate) fn pointer(&self) -> String {
        if self.source.starts_with('/') {
            self.source.clone()
        } else {
            format!("/{}", self.source.replace('.', "/"))
        }
    }
}

/// A sort key computed from a record's source value and stored per
/// record id (§3.5: `<base_path>/<sorter.id>/sort`).
#[derive(Debug, Clone)]
pub struct SorterDef {
    pub id: String,
    pub source: String,
}

impl SorterDef {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        SorterDef {
            id: id.into(),
            source: source.into(),
        }
    }

    pub(crate) fn pointer(&self) -> String {
        if self.source.starts_with('/') {
            self.source.clone()
        } else {
            format!("/{}", self.source.replace('.', "/"))
        }
    }
}

/// An index configuration: where its records live (`base_path`) and how
/// each field/sorter is extracted (§3.5).
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub base_path: String,
    pub fields: Vec<FieldDef>,
    pub sorters: Vec<SorterDef>,
    pub remove_words: HashSet<String>,
}

impl IndexConfig {
    pub fn new(base_path: impl Into<String>) -> Self {
        IndexConfig {
            base_path: base_path.into(),
            fields: Vec::new(),
            sorters: Vec::new(),
            remove_words: default_remove_words(),
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_sorter(mut self, sorter: SorterDef) -> Self {
        self.sorters.push(sorter);
        self
    }

    pub(crate) fn field(&self, id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub(crate) fn id_hash_key(&self) -> String {
        format!("{}/_id", self.base_path)
    }

    pub(crate) fn data_key(&self, record_id: &str) -> String {
        format!("{}/_data/{record_id}", self.base_path)
    }

    pub(crate) fn word_hash_key(&self, field_id: &str, word: &str) -> String {
        format!("{}/{field_id}/word/{word}", self.base_path)
    }

    pub(crate) fn summary_key(&self, field_id: &str) -> String {
        format!("{}/{field_id}/summary", self.base_path)
    }

    pub(crate) fn sort_hash_key(&self, sorter_id: &str) -> String {
        format!("{}/{sorter_id}/sort", self.base_path)
    }
}

/// A small built-in English stopword list; hosts can extend
/// `IndexConfig::remove_words` with domain-specific terms.
fn default_remove_words() -> HashSet<String> {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
        "it", "its", "of", "on", "that", "the", "to", "was", "were", "will", "with",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
