//! The advisory lock manager (§4.1): exclusive locks and shared/reader
//! locks over the same key space, each with a FIFO waiter queue.
//!
//! Locks are in-process only (§9 "Advisory locks are in-process only").
//! A key's entry is removed from the table as soon as it becomes free
//! with no waiters, so hot-but-transient keys don't leak map entries.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// Error returned by a non-waiting lock attempt that could not be
/// granted immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("key is locked")]
pub struct Locked;

enum Mode {
    Exclusive,
    Shared(usize),
}

enum Waiter {
    Exclusive(oneshot::Sender<()>),
    /// The sender fires once this waiter (and its burst-mates) have been
    /// promoted to holders.
    Shared(oneshot::Sender<()>),
}

#[derive(Default)]
struct Entry {
    mode: Option<Mode>,
    waiters: VecDeque<Waiter>,
}

/// The lock manager shared by the Store facade, the list/hash
/// containers, and the transaction layer.
#[derive(Default)]
pub struct LockManager {
    entries: DashMap<String, Arc<Mutex<Entry>>>,
}

/// A held lock. Dropping the guard without calling [`LockGuard::release`]
/// still releases the lock (the guard's `Drop` impl calls the matching
/// `unlock`/`share_unlock`), but `release` is provided for callers that
/// want the release to happen at an exact point rather than at scope
/// exit.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    key: String,
    shared: bool,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Release the lock now rather than waiting for `Drop`.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.shared {
            self.manager.share_unlock(&self.key);
        } else {
            self.manager.unlock(&self.key);
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            entries: DashMap::new(),
        }
    }

    /// Number of keys currently held or awaited. Idle keys are evicted
    /// immediately on release, so this is exactly the count of
    /// outstanding locks, used by the Store's `shutdown` to poll for
    /// quiescence (§4.2).
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }

    fn entry_for(&self, key: &str) -> Arc<Mutex<Entry>> {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Entry::default())))
            .clone()
    }

    /// Remove `key`'s entry from the table if it is free and has no
    /// waiters, keeping the map from growing without bound under churn.
    fn maybe_evict(&self, key: &str, entry: &Arc<Mutex<Entry>>) {
        let is_idle = {
            let guard = entry.lock();
            guard.mode.is_none() && guard.waiters.is_empty()
        };
        if is_idle {
            // Remove only if nobody else grabbed a reference in between.
            self.entries.remove_if(key, |_, v| Arc::ptr_eq(v, entry));
        }
    }

    /// Acquire the exclusive lock on `key`. If already held and `wait` is
    /// false, returns [`Locked`] immediately; if `wait` is true, queues
    /// FIFO behind existing holders/waiters.
    pub async fn lock(&self, key: &str) -> LockGuard<'_> {
        self.lock_inner(key, true).await.expect("wait=true never fails")
    }

    /// Non-blocking exclusive lock attempt.
    pub fn try_lock(&self, key: &str) -> Result<LockGuard<'_>, Locked> {
        let entry = self.entry_for(key);
        let mut guard = entry.lock();
        if guard.mode.is_none() {
            guard.mode = Some(Mode::Exclusive);
            drop(guard);
            Ok(LockGuard {
                manager: self,
                key: key.to_string(),
                shared: false,
                released: false,
            })
        } else {
            drop(guard);
            self.maybe_evict(key, &entry);
            Err(Locked)
        }
    }

    async fn lock_inner(&self, key: &str, wait: bool) -> Result<LockGuard<'_>, Locked> {
        let entry = self.entry_for(key);
        let rx = {
            let mut guard = entry.lock();
            if guard.mode.is_none() {
                guard.mode = Some(Mode::Exclusive);
                None
            } else if !wait {
                return Err(Locked);
            } else {
                let (tx, rx) = oneshot::channel();
                guard.waiters.push_back(Waiter::Exclusive(tx));
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        Ok(LockGuard {
            manager: self,
            key: key.to_string(),
            shared: false,
            released: false,
        })
    }

    /// Release the exclusive lock on `key`. If a waiter is queued, the
    /// head waiter (or, if it and its immediate successors are all
    /// shared waiters, the whole contiguous run) becomes the new holder.
    /// Unlocking a key not held exclusively logs and is a no-op.
    pub fn unlock(&self, key: &str) {
        let entry = self.entry_for(key);
        let mut guard = entry.lock();
        match guard.mode {
            Some(Mode::Exclusive) => {}
            _ => {
                warn!(key, "unlock called on a lock not held exclusively");
                drop(guard);
                self.maybe_evict(key, &entry);
                return;
            }
        }
        Self::promote_next(&mut guard);
        drop(guard);
        self.maybe_evict(key, &entry);
    }

    /// Acquire a shared (reader) lock on `key`. Joins the existing
    /// shared holder set if one exists with no waiters ahead of it;
    /// otherwise queues (or fails immediately if `wait` is false).
    pub async fn share_lock(&self, key: &str) -> LockGuard<'_> {
        self.share_lock_inner(key, true)
            .await
            .expect("wait=true never fails")
    }

    /// Non-blocking shared lock attempt.
    pub fn try_share_lock(&self, key: &str) -> Result<LockGuard<'_>, Locked> {
        let entry = self.entry_for(key);
        let mut guard = entry.lock();
        let waiters_empty = guard.waiters.is_empty();
        match &mut guard.mode {
            None => {
                guard.mode = Some(Mode::Shared(1));
            }
            Some(Mode::Shared(n)) if waiters_empty => {
                *n += 1;
            }
            _ => {
                drop(guard);
                self.maybe_evict(key, &entry);
                return Err(Locked);
            }
        }
        drop(guard);
        Ok(LockGuard {
            manager: self,
            key: key.to_string(),
            shared: true,
            released: false,
        })
    }

    async fn share_lock_inner(&self, key: &str, wait: bool) -> Result<LockGuard<'_>, Locked> {
        let entry = self.entry_for(key);
        let rx = {
            let mut guard = entry.lock();
            let waiters_empty = guard.waiters.is_empty();
            match &mut guard.mode {
                None => {
                    guard.mode = Some(Mode::Shared(1));
                    None
                }
                Some(Mode::Shared(n)) if waiters_empty => {
                    *n += 1;
                    None
                }
                _ if !wait => return Err(Locked),
                _ => {
                    let (tx, rx) = oneshot::channel();
                    guard.waiters.push_back(Waiter::Shared(tx));
                    Some(rx)
                }
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        Ok(LockGuard {
            manager: self,
            key: key.to_string(),
            shared: true,
            released: false,
        })
    }

    /// Release one reader's hold on `key`. When the reader count drops to
    /// zero, the entry converts back to exclusive-empty and the next
    /// waiter (if any) is promoted. Calling this on a key not held
    /// shared logs and is a no-op.
    pub fn share_unlock(&self, key: &str) {
        let entry = self.entry_for(key);
        let mut guard = entry.lock();
        match &mut guard.mode {
            Some(Mode::Shared(n)) => {
                *n -= 1;
                if *n == 0 {
                    guard.mode = None;
                    Self::promote_next(&mut guard);
                }
            }
            _ => {
                warn!(key, "share_unlock called on a lock not held shared");
            }
        }
        drop(guard);
        self.maybe_evict(key, &entry);
    }

    /// Promote the head waiter (and, if it's a shared waiter, every
    /// contiguous shared waiter behind it) to holder. Assumes
    /// `entry.mode` is already `None`.
    fn promote_next(entry: &mut Entry) {
        match entry.waiters.pop_front() {
            None => {}
            Some(Waiter::Exclusive(tx)) => {
                entry.mode = Some(Mode::Exclusive);
                let _ = tx.send(());
            }
            Some(Waiter::Shared(tx)) => {
                let mut readers = 1;
                let mut woken = vec![tx];
                while matches!(entry.waiters.front(), Some(Waiter::Shared(_))) {
                    if let Some(Waiter::Shared(tx)) = entry.waiters.pop_front() {
                        readers += 1;
                        woken.push(tx);
                    }
                }
                entry.mode = Some(Mode::Shared(readers));
                for tx in woken {
                    let _ = tx.send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn exclusive_lock_excludes_waiters_until_unlocked() {
        let mgr = LockManager::new();
        let g1 = mgr.lock("k").await;
        assert!(mgr.try_lock("k").is_err());
        g1.release();
        let _g2 = mgr.lock("k").await;
    }

    #[tokio::test]
    async fn fifo_order_for_exclusive_waiters() {
        let mgr = Arc::new(LockManager::new());
        let g1 = mgr.lock("k").await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let m2 = mgr.clone();
        let o2 = order.clone();
        let h2 = tokio::spawn(async move {
            let g = m2.lock("k").await;
            o2.lock().push(2);
            g.release();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let m3 = mgr.clone();
        let o3 = order.clone();
        let h3 = tokio::spawn(async move {
            let g = m3.lock("k").await;
            o3.lock().push(3);
            g.release();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        g1.release();
        h2.await.unwrap();
        h3.await.unwrap();
        assert_eq!(*order.lock(), vec![2, 3]);
    }

    #[tokio::test]
    async fn shared_locks_can_be_held_concurrently() {
        let mgr = LockManager::new();
        let g1 = mgr.share_lock("k").await;
        let g2 = mgr.share_lock("k").await;
        assert!(mgr.try_lock("k").is_err());
        g1.release();
        assert!(mgr.try_lock("k").is_err());
        g2.release();
        assert!(mgr.try_lock("k").is_ok());
    }

    #[tokio::test]
    async fn exclusive_waiter_blocks_new_shared_joiners() {
        let mgr = Arc::new(LockManager::new());
        let g1 = mgr.share_lock("k").await;

        let m2 = mgr.clone();
        let writer_done = Arc::new(AtomicUsize::new(0));
        let wd2 = writer_done.clone();
        let h2 = tokio::spawn(async move {
            let g = m2.lock("k").await;
            wd2.store(1, Ordering::SeqCst);
            g.release();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A fresh shared request must queue behind the exclusive waiter,
        // not jump ahead of it.
        assert!(mgr.try_share_lock("k").is_err());

        g1.release();
        h2.await.unwrap();
        assert_eq!(writer_done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unlock_wrong_mode_is_noop() {
        let mgr = LockManager::new();
        mgr.unlock("never-locked");
        let g = mgr.share_lock("k").await;
        mgr.unlock("k"); // held shared, not exclusive: no-op
        assert!(mgr.try_share_lock("k").is_ok());
        g.release();
    }

    #[tokio::test]
    async fn idle_entries_are_evicted() {
        let mgr = LockManager::new();
        let g = mgr.lock("k").await;
        assert_eq!(mgr.entries.len(), 1);
        g.release();
        assert_eq!(mgr.entries.len(), 0);
    }
}
