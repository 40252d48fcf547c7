#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{Recorder, open, options, wait_until};
use futures::StreamExt as _;
use ttl_fcache::{CacheError, CacheEvent, EndOptions, IoClass, WriteOutcome, WriteStreamOutcome};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_is_read_in_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"0123456789").unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;

    let mut session = cache.read_as_stream("f", 4).await.unwrap().unwrap();
    assert!(!session.is_from_memory());
    let mut chunks = Vec::new();
    while let Some(chunk) = session.next_chunk().await.unwrap() {
        chunks.push(chunk);
    }
    session.end(EndOptions::default().wait_for_close(true)).await.unwrap();

    assert_eq!(
        chunks,
        [&b"0123"[..], b"4567", b"89"].map(Bytes::from_static)
    );
    assert_eq!(rec.count(CacheEvent::ReadStreamChunk), 3);
    assert_eq!(rec.count(CacheEvent::ReadStreamComplete), 1);
    assert_eq!(rec.count(CacheEvent::ReadStreamClosed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_is_streamed_from_memory() {
    let tmp = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;
    cache.write_as_buffer("f", "in memory").await.unwrap();

    let session = cache.read_as_stream("f", 0).await.unwrap().unwrap();
    assert!(session.is_from_memory());
    let chunks: Vec<_> = session.into_stream().collect().await;
    let chunks: Vec<Bytes> = chunks.into_iter().map(Result::unwrap).collect();

    assert_eq!(chunks, [Bytes::from_static(b"in memory")]);
    assert_eq!(rec.count(CacheEvent::ReadStartFromFile), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ending_delivers_the_rest_to_the_data_handler() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"abcdefgh").unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut session = cache.read_as_stream("f", 3).await.unwrap().unwrap();
    {
        let seen = Arc::clone(&seen);
        session.on_data(move |chunk| seen.lock().unwrap().extend_from_slice(chunk));
    }
    assert_eq!(session.next_chunk().await.unwrap().as_deref(), Some(&b"abc"[..]));
    session.end(EndOptions::default()).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), b"abcdefgh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_the_data_handler_discards_the_rest() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"abcdefgh").unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut session = cache.read_as_stream("f", 3).await.unwrap().unwrap();
    {
        let seen = Arc::clone(&seen);
        session.on_data(move |chunk| seen.lock().unwrap().extend_from_slice(chunk));
    }
    session
        .end(EndOptions::default().remove_data_handler(true))
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());

    // The read no longer holds the file.
    assert_eq!(
        cache.write_as_buffer("f", "next").await.unwrap(),
        WriteOutcome::CompletedSuccessfully
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streamed_write_replaces_the_file() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"previous contents").unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;
    assert!(cache.read_as_buffer("f").await.unwrap().is_some());

    let mut session = cache
        .write_as_stream("f", 4, None)
        .await
        .unwrap()
        .into_session()
        .unwrap();
    for part in ["stream", "ed ", "write"] {
        session.write(part).await.unwrap();
    }
    session
        .end(EndOptions::default().wait_for_close(true))
        .await
        .unwrap();

    assert_eq!(std::fs::read(tmp.path().join("f")).unwrap(), b"streamed write");
    assert!(rec.count(CacheEvent::WriteStreamBufferFull) >= 1);
    assert_eq!(rec.count(CacheEvent::WriteStreamClosed), 1);

    rec.clear();
    let bytes = cache.read_as_buffer("f").await.unwrap();
    assert_eq!(bytes.as_deref(), Some(&b"streamed write"[..]));
    assert_eq!(rec.count(CacheEvent::ReadStartFromFile), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_write_cancels_a_pending_buffer_write() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"0").unwrap();
    let rec = Recorder::new();
    let cache = Arc::new(open(tmp.path(), options(&rec)).await);

    let reader = cache.read_as_stream("f", 16).await.unwrap().unwrap();
    let buffered = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.write_as_buffer("f", "buffered").await })
    };
    wait_until(WAIT, "the buffer write to queue", || {
        rec.count(CacheEvent::WriteQueuedBehindReads) == 1
    })
    .await;

    let streamed = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut session = cache
                .write_as_stream("f", 0, None)
                .await
                .unwrap()
                .into_session()
                .unwrap();
            session.write("streamed").await.unwrap();
            session.end(EndOptions::default()).await
        })
    };
    assert_eq!(
        buffered.await.unwrap().unwrap(),
        WriteOutcome::CanceledByNewerRequest
    );

    drop(reader);
    streamed.await.unwrap().unwrap();
    assert_eq!(
        cache.read_as_buffer("f").await.unwrap().as_deref(),
        Some(&b"streamed"[..])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffer_write_cancels_a_pending_stream_write() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f"), b"0").unwrap();
    let rec = Recorder::new();
    let cache = Arc::new(open(tmp.path(), options(&rec)).await);

    let reader = cache.read_as_stream("f", 16).await.unwrap().unwrap();
    let streamed = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.write_as_stream("f", 0, None).await })
    };
    wait_until(WAIT, "the stream write to queue", || {
        rec.count(CacheEvent::WriteQueuedBehindReads) == 1
    })
    .await;

    let buffered = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.write_as_buffer("f", "buffered").await })
    };
    assert!(matches!(
        streamed.await.unwrap().unwrap(),
        WriteStreamOutcome::CanceledByNewerRequest
    ));

    drop(reader);
    assert_eq!(
        buffered.await.unwrap().unwrap(),
        WriteOutcome::CompletedSuccessfully
    );
    assert_eq!(std::fs::read(tmp.path().join("f")).unwrap(), b"buffered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_write_session_frees_the_file() {
    let tmp = tempfile::tempdir().unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;

    let mut session = cache
        .write_as_stream("f", 0, None)
        .await
        .unwrap()
        .into_session()
        .unwrap();
    session.write("abandoned").await.unwrap();
    drop(session);
    assert_eq!(rec.count(CacheEvent::WriteStreamAbandoned), 1);

    assert_eq!(
        cache.write_as_buffer("f", "after").await.unwrap(),
        WriteOutcome::CompletedSuccessfully
    );
    assert_eq!(std::fs::read(tmp.path().join("f")).unwrap(), b"after");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_write_session_is_finalised_after_the_error_timeout() {
    if !std::path::Path::new("/dev/full").exists() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("/dev/full", tmp.path().join("full")).unwrap();
    let rec = Recorder::new();
    let cache = open(tmp.path(), options(&rec)).await;

    let mut session = cache
        .write_as_stream("full", 4, Some(Duration::from_millis(100)))
        .await
        .unwrap()
        .into_session()
        .unwrap();

    // Errors from the file may surface one operation late.
    let mut failure = None;
    for _ in 0..16 {
        if let Err(e) = session.write([0_u8; 16]).await {
            failure = Some(e);
            break;
        }
    }
    let failure = failure.unwrap();
    assert_eq!(failure.io_class(), Some(IoClass::NoSpace));

    let again = session.write("more").await.unwrap_err();
    assert!(matches!(again, CacheError::SessionFailed { .. }), "{again}");

    wait_until(WAIT, "the forced finalisation", || {
        rec.count(CacheEvent::WriteStreamForcedFinalize) == 1
    })
    .await;
    drop(session);
    assert_eq!(rec.count(CacheEvent::WriteStreamAbandoned), 0);
}
