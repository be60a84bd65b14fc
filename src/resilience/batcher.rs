//! Request batcher: coalesces identical in-flight requests.
//!
//! The first call for a key opens a window (fixed from that first arrival,
//! never extended). Every call for the same key inside the window joins the
//! group. When the window closes the group leaves the pending map and its
//! factory runs exactly once; all members get that one outcome.
//!
//! A group is only driven by its waiters. If all of them are cancelled the
//! factory never runs, and the expired entry is purged on the next call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Default coalescing window.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(50);

type Group<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct PendingGroup<T, E> {
    id: u64,
    deadline: Instant,
    group: Group<T, E>,
}

/// Batcher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherConfig {
    pub window: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_BATCH_WINDOW,
        }
    }
}

/// Counts of calls and underlying executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub calls: u64,
    pub executions: u64,
}

/// Throttle-window request coalescer keyed by request signature.
///
/// `T` and `E` are `Clone` because one outcome is handed to every waiter.
pub struct RequestBatcher<T, E> {
    config: BatcherConfig,
    pending: Arc<Mutex<HashMap<String, PendingGroup<T, E>>>>,
    next_id: AtomicU64,
    calls: AtomicU64,
    executions: Arc<AtomicU64>,
}

impl<T, E> Default for RequestBatcher<T, E> {
    fn default() -> Self {
        Self::new(BatcherConfig::default())
    }
}

impl<T, E> RequestBatcher<T, E> {
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            executions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Number of groups whose window is still open.
    pub fn pending(&self) -> usize {
        let now = Instant::now();
        self.pending
            .lock()
            .values()
            .filter(|open| open.deadline > now)
            .count()
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            calls: self.calls.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
        }
    }
}

impl<T, E> RequestBatcher<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Join (or open) the group for `key` and wait for its outcome.
    ///
    /// `factory` is only invoked if this call opens the group.
    pub async fn batch<F, Fut>(&self, key: &str, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let group = {
            let now = Instant::now();
            let mut pending = self.pending.lock();
            pending.retain(|_, open| open.deadline > now);
            match pending.get(key) {
                Some(open) => {
                    tracing::debug!("Joining batch for {}", key);
                    open.group.clone()
                }
                None => {
                    let open = self.open_group(key, now, factory);
                    let group = open.group.clone();
                    pending.insert(key.to_string(), open);
                    group
                }
            }
        };

        group.await
    }

    fn open_group<F, Fut>(&self, key: &str, now: Instant, factory: F) -> PendingGroup<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = now + self.config.window;
        let pending = Arc::clone(&self.pending);
        let executions = Arc::clone(&self.executions);
        let key = key.to_string();

        let group = async move {
            tokio::time::sleep_until(deadline).await;
            {
                // A later group may already own the key.
                let mut pending = pending.lock();
                if pending.get(&key).is_some_and(|open| open.id == id) {
                    pending.remove(&key);
                }
            }
            executions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Batch window closed for {}", key);
            factory().await
        }
        .boxed()
        .shared();

        PendingGroup {
            id,
            deadline,
            group,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicUsize;

    fn counted(
        calls: &Arc<AtomicUsize>,
        result: Result<u32, String>,
    ) -> impl FnOnce() -> futures_util::future::Ready<Result<u32, String>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(result)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_execution() {
        let batcher: RequestBatcher<u32, String> = RequestBatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let futures = (0..10u32).map(|i| batcher.batch("X", counted(&calls, Ok(100 + i))));
        let results = join_all(futures).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r == &Ok(100)));
        assert_eq!(batcher.stats(), BatcherStats { calls: 10, executions: 1 });
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_is_delivered_to_every_waiter() {
        let batcher: RequestBatcher<u32, String> = RequestBatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let futures = (0..3).map(|_| batcher.batch("X", counted(&calls, Err("down".into()))));
        let results = join_all(futures).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Err("down".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_coalesce() {
        let batcher: RequestBatcher<u32, String> = RequestBatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            batcher.batch("A", counted(&calls, Ok(1))),
            batcher.batch("B", counted(&calls, Ok(2)))
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_fixed_from_first_arrival() {
        let batcher = Arc::new(RequestBatcher::<u32, String>::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let first = {
            let batcher = Arc::clone(&batcher);
            let factory = counted(&calls, Ok(1));
            tokio::spawn(async move { batcher.batch("X", factory).await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Joins the open window; must not push the deadline out.
        let second = batcher.batch("X", counted(&calls, Ok(2))).await;

        assert_eq!(second, Ok(1));
        assert_eq!(first.await.unwrap(), Ok(1));
        let elapsed = start.elapsed();
        assert!(elapsed >= DEFAULT_BATCH_WINDOW && elapsed < Duration::from_millis(90));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_group_is_never_joined() {
        let batcher: RequestBatcher<u32, String> = RequestBatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        // The only waiter gives up before the window closes.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            batcher.batch("X", counted(&calls, Ok(1))),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(batcher.pending(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(batcher.pending(), 0);

        assert_eq!(batcher.batch("X", counted(&calls, Ok(2))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.stats().executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_after_window_starts_new_group() {
        let batcher: RequestBatcher<u32, String> = RequestBatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(batcher.batch("X", counted(&calls, Ok(1))).await, Ok(1));
        assert_eq!(batcher.batch("X", counted(&calls, Ok(2))).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
