//! The bounded background task queue (§4.2, §5): `expire_set` tasks and
//! arbitrary `custom` side-effects, each processed with a per-task
//! timeout. A timed-out task's effect is simply dropped — it is the
//! future itself that stops being polled, not a signal sent to it
//! (§5: "drops the task's completion hook, not the task itself").

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A boxed, already-built side effect to run on the worker task.
pub type BoxedEffect = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A queued unit of background work (§4.2's `enqueue`).
pub enum Task {
    /// Record `key` on the daily cleanup list (and optionally the
    /// `_cleanup/expires` summary hash) for `expiration`.
    ExpireSet { key: String, expiration: i64 },
    /// An arbitrary host-supplied effect.
    Custom(BoxedEffect),
}

pub type ExpireHandler = Arc<dyn Fn(String, i64) -> BoxedEffect + Send + Sync>;

/// Owns the worker task and the channel feeding it. Dropping a `Queue`
/// stops accepting new tasks; in-flight work keeps running to
/// completion since the worker is a detached `tokio::spawn`.
pub struct Queue {
    sender: mpsc::Sender<Task>,
    worker: JoinHandle<()>,
}

impl Queue {
    pub fn spawn(capacity: usize, timeout: Duration, on_expire_set: ExpireHandler) -> Self {
        let (sender, mut receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                let effect: BoxedEffect = match task {
                    Task::ExpireSet { key, expiration } => on_expire_set(key, expiration),
                    Task::Custom(effect) => effect,
                };
                if tokio::time::timeout(timeout, effect).await.is_err() {
                    warn!("background task exceeded its timeout and was dropped");
                }
            }
        });
        Queue { sender, worker }
    }

    /// Submit a task, applying backpressure if the queue is full.
    pub async fn enqueue(&self, task: Task) {
        if self.sender.send(task).await.is_err() {
            warn!("background queue worker is gone; task dropped");
        }
    }

    /// Outstanding (queued, not yet picked up) task count.
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Wait until the queue has fully drained, polling every 250 ms
    /// (§4.2's `shutdown`).
    pub async fn drain(&self) {
        while self.depth() > 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    pub fn abort(&self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn custom_task_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = ran.clone();
        let q = Queue::spawn(
            8,
            Duration::from_secs(5),
            Arc::new(|_: String, _: i64| -> BoxedEffect { Box::pin(async {}) }),
        );
        q.enqueue(Task::Custom(Box::pin(async move {
            r2.store(1, Ordering::SeqCst);
        })))
        .await;
        q.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expire_set_invokes_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s2 = seen.clone();
        let q = Queue::spawn(
            8,
            Duration::from_secs(5),
            Arc::new(move |_key: String, expiration: i64| -> BoxedEffect {
                s2.store(expiration as usize, Ordering::SeqCst);
                Box::pin(async {})
            }),
        );
        q.enqueue(Task::ExpireSet {
            key: "k".into(),
            expiration: 42,
        })
        .await;
        q.drain().await;
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn timed_out_task_is_dropped_without_panicking() {
        let q = Queue::spawn(
            8,
            Duration::from_millis(10),
            Arc::new(|_: String, _: i64| -> BoxedEffect { Box::pin(async {}) }),
        );
        q.enqueue(Task::Custom(Box::pin(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })))
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
