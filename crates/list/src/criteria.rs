//! Per-item match criteria for `find`/`find_each`/`find_cut` (§4.3, §9).
//!
//! A criterion is either an equality test or a compiled regular
//! expression, per §9's guidance that Rust's regex facility should be
//! accepted as a first-class alternative to a literal value rather than
//! as an opaque predicate closure.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// A single field's match test.
#[derive(Debug, Clone)]
pub enum Criterion {
    /// The field must equal this JSON value exactly.
    Eq(Value),
    /// The field, read as a string, must match this pattern.
    Regex(Regex),
}

/// A full match spec: an item matches when *every* named field satisfies
/// its criterion (§4.3: "an item matches when all keys of the criteria
/// match").
pub type Criteria = BTreeMap<String, Criterion>;

/// Test whether `item` (expected to be a JSON object) satisfies every
/// criterion.
pub fn matches(item: &Value, criteria: &Criteria) -> bool {
    let Some(obj) = item.as_object() else {
        return false;
    };
    criteria.iter().all(|(field, criterion)| {
        let Some(value) = obj.get(field) else {
            return false;
        };
        match criterion {
            Criterion::Eq(expected) => value == expected,
            Criterion::Regex(re) => value.as_str().map(|s| re.is_match(s)).unwrap_or(false),
        }
    })
}
