#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Recorder, open, settle, wait_until};
use ttl_fcache::{CacheEvent, CacheObserver, CacheOptions, ReadLimiter};

const WAIT: Duration = Duration::from_secs(5);

fn limited(rec: &Arc<Recorder>, global: usize, per_file: usize) -> (CacheOptions, Arc<ReadLimiter>) {
    let limiter = Arc::new(ReadLimiter::new(global));
    let options = CacheOptions::default()
        .with_observer(Arc::clone(rec) as Arc<dyn CacheObserver>)
        .with_read_limiter(Arc::clone(&limiter))
        .with_max_file_reads(per_file);
    (options, limiter)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn global_limit_spans_files() {
    let tmp = tempfile::tempdir().unwrap();
    for name in ["a", "b", "c"] {
        std::fs::write(tmp.path().join(name), name).unwrap();
    }
    let rec = Recorder::new();
    let (options, limiter) = limited(&rec, 2, 8);
    let cache = Arc::new(open(tmp.path(), options).await);

    let a = cache.read_as_stream("a", 16).await.unwrap().unwrap();
    let _b = cache.read_as_stream("b", 16).await.unwrap().unwrap();
    assert_eq!(limiter.in_use(), 2);

    let third = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.read_as_buffer("c").await })
    };
    wait_until(WAIT, "the third read to queue", || {
        rec.count(CacheEvent::ReadQueuedGlobalLimit) == 1
    })
    .await;
    settle().await;
    assert!(!third.is_finished());
    assert_eq!(limiter.in_use(), 2);

    drop(a);
    assert_eq!(third.await.unwrap().unwrap().as_deref(), Some(&b"c"[..]));
    assert!(limiter.in_use() <= limiter.max());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_file_limit_queues_reads_of_one_file() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"hot").unwrap();
    let rec = Recorder::new();
    let (options, limiter) = limited(&rec, 16, 2);
    let cache = Arc::new(open(tmp.path(), options).await);

    let first = cache.read_as_stream("f", 16).await.unwrap().unwrap();
    let _second = cache.read_as_stream("f", 16).await.unwrap().unwrap();

    let third = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut session = cache.read_as_stream("f", 16).await.unwrap().unwrap();
            session.next_chunk().await.unwrap()
        })
    };
    wait_until(WAIT, "the third read to queue", || {
        rec.count(CacheEvent::ReadQueuedFileLimit) == 1
    })
    .await;
    assert_eq!(rec.count(CacheEvent::ReadQueuedGlobalLimit), 0);
    assert_eq!(limiter.in_use(), 2);

    drop(first);
    assert_eq!(third.await.unwrap().as_deref(), Some(&b"hot"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slots_are_released_at_end_of_data() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"0123456789").unwrap();
    let rec = Recorder::new();
    let (options, limiter) = limited(&rec, 1, 1);
    let cache = open(tmp.path(), options).await;

    let mut session = cache.read_as_stream("f", 4).await.unwrap().unwrap();
    assert_eq!(limiter.in_use(), 1);
    while session.next_chunk().await.unwrap().is_some() {}
    assert_eq!(limiter.in_use(), 0);

    // The session is still open but no longer blocks other reads.
    let bytes = cache.read_as_buffer("f").await.unwrap();
    assert_eq!(bytes.as_deref(), Some(&b"0123456789"[..]));
    drop(session);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_reads_never_exceed_the_limit() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..12 {
        std::fs::write(tmp.path().join(format!("f{i}")), vec![b'x'; 4096]).unwrap();
    }
    let rec = Recorder::new();
    let (options, limiter) = limited(&rec, 3, 1);
    let cache = Arc::new(open(tmp.path(), options).await);

    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..12 {
        let cache = Arc::clone(&cache);
        let limiter = Arc::clone(&limiter);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let mut session = cache.read_as_stream(&format!("f{i}"), 512).await.unwrap().unwrap();
            while session.next_chunk().await.unwrap().is_some() {
                peak.fetch_max(limiter.in_use(), std::sync::atomic::Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    assert_eq!(limiter.in_use(), 0);
}
