#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ttl_fcache::{CacheDirectory, CacheEvent, CacheObserver, CacheOptions, EntityKey, ReadLimiter};

/// An observer that records every event it receives.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(EntityKey, PathBuf, CacheEvent)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of times `event` was observed.
    pub fn count(&self, event: CacheEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, e)| *e == event)
            .count()
    }

    /// All observed events, in order.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().unwrap().iter().map(|(_, _, e)| *e).collect()
    }

    /// Distinct entities that reported `event`.
    pub fn keys_for(&self, event: CacheEvent) -> Vec<EntityKey> {
        let mut keys: Vec<_> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, e)| *e == event)
            .map(|(k, _, _)| *k)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl CacheObserver for Recorder {
    fn on_event(&self, key: EntityKey, path: &Path, event: CacheEvent) {
        self.events
            .lock()
            .unwrap()
            .push((key, path.to_path_buf(), event));
    }
}

/// Options with a recorder attached and a private global read limiter, so tests running in
/// parallel do not share read slots.
pub fn options(recorder: &Arc<Recorder>) -> CacheOptions {
    CacheOptions::default()
        .with_observer(Arc::clone(recorder) as Arc<dyn CacheObserver>)
        .with_read_limiter(Arc::new(ReadLimiter::new(16)))
}

/// Open a cache directory over `dir` with `options`.
pub async fn open(dir: &Path, options: CacheOptions) -> CacheDirectory {
    CacheDirectory::open(dir, false, options).await.unwrap()
}

/// Poll `cond` until it returns true, or panic after `timeout`.
pub async fn wait_until(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Give spawned tasks a moment to reach their next suspension point.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
