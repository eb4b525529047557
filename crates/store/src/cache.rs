//! The RAM mirror for JSON keys matching `cache_key_match` (§4.2): a
//! plain map, not an LRU — no TTL, no eviction beyond explicit
//! invalidation on write/delete.

use dashmap::DashMap;
use regex::Regex;
use serde_json::Value as Json;

pub struct Cache {
    pattern: Option<Regex>,
    entries: DashMap<String, Json>,
}

impl Cache {
    pub fn new(pattern: Option<Regex>) -> Self {
        Cache {
            pattern,
            entries: DashMap::new(),
        }
    }

    fn applies_to(&self, key: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(key))
    }

    pub fn get(&self, key: &str) -> Option<Json> {
        if !self.applies_to(key) {
            return None;
        }
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn put(&self, key: &str, value: &Json) {
        if self.applies_to(key) {
            self.entries.insert(key.to_string(), value.clone());
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_matching_keys_are_cached() {
        let cache = Cache::new(Some(Regex::new(r"^users/").unwrap()));
        cache.put("users/bob", &json!({"a": 1}));
        cache.put("sessions/xyz", &json!({"b": 2}));
        assert_eq!(cache.get("users/bob"), Some(json!({"a": 1})));
        assert_eq!(cache.get("sessions/xyz"), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = Cache::new(Some(Regex::new(r".*").unwrap()));
        cache.put("k", &json!(1));
        cache.invalidate("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn no_pattern_disables_caching() {
        let cache = Cache::new(None);
        cache.put("k", &json!(1));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }
}
