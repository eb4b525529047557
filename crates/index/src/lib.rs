//! The inverted indexer (§4.5, §3.5): a tokenizer pipeline for word,
//! date, and number fields, three query forms (simple query strings,
//! structured query objects, and the PxQL grammar), Boolean evaluation
//! over per-field word hashes, and `search_single`'s synthetic
//! single-record evaluation for live views.

pub mod field;
pub mod indexer;
pub mod query;
pub mod tokenize;

pub use field::{FieldDef, FieldType, IndexConfig, SorterDef};
pub use indexer::{FieldIndex, Indexer};
pub use query::{parse_pxql, parse_simple, Mode, Query, RangeOp};
