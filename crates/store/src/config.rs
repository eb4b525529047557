//! Store-level configuration (§6.2). Every option the Store itself
//! reads; each engine owns its own sub-configuration separately.

use regex::Regex;
use std::time::Duration;

/// Options recognized by the Store facade.
#[derive(Clone)]
pub struct StoreConfig {
    pub list_page_size: usize,
    pub hash_page_size: usize,
    /// Bound on parallel fan-out for `put_multi`/`get_multi`/`head_multi`/
    /// `delete_multi`.
    pub concurrency: usize,
    /// JSON keys matching this pattern are mirrored in the in-process RAM
    /// cache. `None` disables caching entirely.
    pub cache_key_match: Option<Regex>,
    /// Whether `expire` also maintains the `_cleanup/expires` summary hash
    /// in addition to the daily cleanup list.
    pub expiration_updates: bool,
    /// Per-task timeout for the background queue.
    pub queue_timeout: Duration,
    /// Bound on the number of tasks the background queue holds before
    /// `enqueue` applies backpressure.
    pub queue_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            list_page_size: kvlayer_list::DEFAULT_PAGE_SIZE,
            hash_page_size: kvlayer_hash::DEFAULT_PAGE_SIZE,
            concurrency: 1,
            cache_key_match: None,
            expiration_updates: false,
            queue_timeout: Duration::from_secs(30),
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = StoreConfig::default();
        assert_eq!(c.list_page_size, 50);
        assert_eq!(c.hash_page_size, 50);
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.queue_timeout, Duration::from_secs(30));
    }
}
