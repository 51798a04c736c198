//! Keyed one-shot timers with arm/cancel semantics.
//!
//! At most one timer is armed per key. Arming a key that already has a timer
//! aborts the old one first. When a timer fires it claims (removes) its own
//! entry before running the callback, so a `cancel` that returns `true`
//! guarantees the callback never runs, and a fired callback runs once.
//!
//! Timers sleep on the tokio clock; tests drive them with a paused clock.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

/// A table of cancellable one-shot timers indexed by key.
pub struct KeyedTimers<K> {
    armed: Arc<Mutex<HashMap<K, Armed>>>,
    generation: AtomicU64,
}

impl<K> KeyedTimers<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            armed: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm a timer for `key`, replacing any timer already armed for it.
    ///
    /// Returns `true` when an earlier timer was replaced.
    pub async fn arm<F, Fut>(&self, key: K, delay: Duration, on_fire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut armed = self.armed.lock().await;

        let table = self.armed.clone();
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = {
                let mut armed = table.lock().await;
                match armed.get(&fire_key) {
                    Some(entry) if entry.generation == generation => {
                        armed.remove(&fire_key);
                        true
                    }
                    _ => false,
                }
            };
            if claimed {
                on_fire().await;
            }
        });

        match armed.insert(key, Armed { generation, handle }) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel the timer for `key`. Idempotent; returns whether one was armed.
    pub async fn cancel(&self, key: &K) -> bool {
        match self.armed.lock().await.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a timer is currently armed for `key`.
    pub async fn is_armed(&self, key: &K) -> bool {
        self.armed.lock().await.contains_key(key)
    }

    /// Number of armed timers.
    pub async fn len(&self) -> usize {
        self.armed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancel every armed timer.
    pub async fn cancel_all(&self) {
        for (_, entry) in self.armed.lock().await.drain() {
            entry.handle.abort();
        }
    }
}

impl<K> Default for KeyedTimers<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(c: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let c = c.clone();
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timers = KeyedTimers::new();
        let fired = counter();
        timers.arm("a", Duration::from_secs(10), bump(&fired)).await;

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.is_armed(&"a").await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&"a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire_and_is_idempotent() {
        let timers = KeyedTimers::new();
        let fired = counter();
        timers.arm("a", Duration::from_secs(5), bump(&fired)).await;

        assert!(timers.cancel(&"a").await);
        assert!(!timers.cancel(&"a").await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let timers = KeyedTimers::new();
        let first = counter();
        let second = counter();

        assert!(!timers.arm("a", Duration::from_secs(5), bump(&first)).await);
        assert!(timers.arm("a", Duration::from_secs(8), bump(&second)).await);
        assert_eq!(timers.len().await, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let timers = KeyedTimers::new();
        let fired = counter();
        timers.arm("a", Duration::from_secs(1), bump(&fired)).await;
        timers.arm("b", Duration::from_secs(1), bump(&fired)).await;
        timers.cancel(&"a").await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty().await);
    }
}
