//! Per-file coordination.
//!
//! One [`CacheEntity`] exists per file identity. It owns the memory snapshot, the bookkeeping of
//! in-flight reads and writes, the single pending write, the queue of readers parked behind a
//! write, and the two idle timers. All of that lives behind one mutex that is never held across an
//! `.await`: every transition is a short critical section, and filesystem I/O happens outside of
//! it.
//!
//! The rules, in short:
//!
//! * at most one write (or TTL deletion) touches the file at a time;
//! * a buffer write is visible in memory the moment it is submitted;
//! * a newer write supersedes a pending one, which resolves as
//!   [`WriteOutcome::CanceledByNewerRequest`] without touching the disk;
//! * concurrent buffer reads of the same file share one filesystem read;
//! * a read that finds no snapshot while a write is active parks until the write lands.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt as _, Shared};
use rustc_hash::FxHashSet;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cache::limiter::{ReadLimiter, ReadSlot};
use crate::cache::observer::{self, CacheEvent};
use crate::cache::ttl::{Expire, TimerKind, TimerPoll, TtlTimer};
use crate::directory::Settings;
use crate::error::CacheError;
use crate::fs::identity::{EntityKey, Registry};
use crate::stream::read::ReadSession;
use crate::stream::write::{WriteSession, WriteStreamOutcome};

/// How a buffer write was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOutcome {
    /// The bytes were written to the file.
    CompletedSuccessfully,
    /// The bytes equalled the memory snapshot; nothing was written.
    SkippedSameAsMemoryCache,
    /// A newer write arrived before this one started; nothing was written.
    CanceledByNewerRequest,
}

/// An operation attempted on an entity that may have retired since it was resolved.
pub(crate) enum Attempt<T> {
    Done(T),
    /// The entity left the registry; the name must be resolved again.
    Retired,
}

type SharedRead = Shared<BoxFuture<'static, Result<Option<Bytes>, CacheError>>>;

enum ReadStep {
    Join(SharedRead),
    Park(oneshot::Receiver<()>),
}

/// Who currently owns the right to modify the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteSlot {
    Idle,
    Buffer(u64),
    Stream(u64),
    Removing(u64),
}

/// A requested write that has not started yet.
enum PendingWrite {
    Buffer {
        bytes: Bytes,
        path: PathBuf,
        reply: oneshot::Sender<Result<WriteOutcome, CacheError>>,
    },
    Stream {
        path: PathBuf,
        reply: oneshot::Sender<StreamGrant>,
    },
}

impl PendingWrite {
    fn cancel(self) {
        // The requester may have stopped waiting; that is fine.
        match self {
            Self::Buffer { reply, .. } => {
                let _ = reply.send(Ok(WriteOutcome::CanceledByNewerRequest));
            }
            Self::Stream { reply, .. } => {
                let _ = reply.send(StreamGrant::Canceled);
            }
        }
    }
}

/// Reply to a stream write request.
pub(crate) enum StreamGrant {
    Granted(WriteLease),
    Canceled,
}

struct EntityState {
    snapshot: Option<Bytes>,
    /// Bumped on every snapshot change, so a failed write only rolls back its own snapshot.
    snapshot_gen: u64,
    names: FxHashSet<Arc<str>>,
    last_path: PathBuf,

    reads_in_flight: usize,
    coalesced: Option<(u64, SharedRead)>,
    parked: VecDeque<oneshot::Sender<()>>,

    write: WriteSlot,
    pending: Option<PendingWrite>,

    memory_timer: TtlTimer,
    file_timer: TtlTimer,

    /// The file was deleted or recreated empty, so it does not hold the snapshot's bytes.
    file_removed: bool,
    retired: bool,
    next_op: u64,
}

impl EntityState {
    fn next_op(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    /// A write (or deletion) is running or waiting to run.
    fn write_active(&self) -> bool {
        self.write != WriteSlot::Idle || self.pending.is_some()
    }

    /// The snapshot is newer than the file.
    fn buffer_write_active(&self) -> bool {
        matches!(self.write, WriteSlot::Buffer(_))
            || matches!(self.pending, Some(PendingWrite::Buffer { .. }))
    }

    fn busy(&self) -> bool {
        self.reads_in_flight > 0 || self.write_active()
    }

    fn set_snapshot(&mut self, bytes: Bytes) {
        self.snapshot = Some(bytes);
        self.snapshot_gen += 1;
    }

    fn clear_snapshot(&mut self) -> bool {
        if self.snapshot.take().is_some() {
            self.snapshot_gen += 1;
            true
        } else {
            false
        }
    }

    fn park(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.parked.push_back(tx);
        rx
    }

    fn wake_parked(&mut self) {
        for waiter in self.parked.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn should_retire(&self) -> bool {
        !self.retired
            && !self.busy()
            && self.coalesced.is_none()
            && (self.names.is_empty() || (self.file_removed && self.snapshot.is_none()))
    }
}

/// Coordinator for every operation on one file identity.
pub struct CacheEntity {
    key: EntityKey,
    settings: Arc<Settings>,
    registry: Weak<Registry>,
    file_reads: ReadLimiter,
    state: Mutex<EntityState>,
}

impl CacheEntity {
    pub(crate) fn new(
        key: EntityKey,
        settings: Arc<Settings>,
        registry: Weak<Registry>,
        path: &Path,
    ) -> Arc<Self> {
        let file_reads = ReadLimiter::new(settings.max_file_reads);
        Arc::new(Self {
            key,
            settings,
            registry,
            file_reads,
            state: Mutex::new(EntityState {
                snapshot: None,
                snapshot_gen: 0,
                names: FxHashSet::default(),
                last_path: path.to_path_buf(),
                reads_in_flight: 0,
                coalesced: None,
                parked: VecDeque::new(),
                write: WriteSlot::Idle,
                pending: None,
                memory_timer: TtlTimer::default(),
                file_timer: TtlTimer::default(),
                file_removed: false,
                retired: false,
                next_op: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The identity this entity coordinates.
    pub(crate) fn key(&self) -> EntityKey {
        self.key
    }

    pub(crate) fn emit(&self, path: &Path, event: CacheEvent) {
        observer::emit(self.settings.observer.as_ref(), self.key, path, event);
    }

    /// Attach `name`. Returns `false` if the entity was already retired.
    pub(crate) fn link_name(&self, name: &Arc<str>) -> bool {
        let mut st = self.lock();
        if st.retired {
            return false;
        }
        st.names.insert(Arc::clone(name));
        true
    }

    /// Detach `name`, retiring the entity if that was its last name and it is idle.
    pub(crate) fn unlink_name(self: &Arc<Self>, name: &str) {
        let mut st = self.lock();
        st.names.remove(name);
        let retire = st.should_retire();
        drop(st);
        if retire {
            self.retire();
        }
    }

    /// The resolver had to create the file, so whatever is on disk is not the snapshot.
    pub(crate) fn note_file_created(&self) {
        self.lock().file_removed = true;
    }

    // ---------------------------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------------------------

    /// Read the whole file, preferring the memory snapshot.
    pub(crate) async fn read_as_buffer(
        self: &Arc<Self>,
        path: &Path,
    ) -> Result<Attempt<Option<Bytes>>, CacheError> {
        loop {
            let step = {
                let mut st = self.lock();
                if st.retired {
                    return Ok(Attempt::Retired);
                }
                st.last_path = path.to_path_buf();

                if let Some(bytes) = st.snapshot.clone() {
                    self.touch(&mut st);
                    self.emit(path, CacheEvent::ReadFromMemory);
                    return Ok(Attempt::Done(Some(bytes)));
                }

                if st.write_active() {
                    self.emit(path, CacheEvent::ReadQueuedBehindWrite);
                    ReadStep::Park(st.park())
                } else if let Some((_, shared)) = &st.coalesced {
                    self.emit(path, CacheEvent::ReadJoinedInFlight);
                    ReadStep::Join(shared.clone())
                } else {
                    ReadStep::Join(self.begin_buffer_read(&mut st, path))
                }
            };

            match step {
                ReadStep::Join(read) => return read.await.map(Attempt::Done),
                ReadStep::Park(woken) => {
                    // A dropped sender only means the queue was cleared; re-check either way.
                    let _ = woken.await;
                    self.emit(path, CacheEvent::ReadWoken);
                }
            }
        }
    }

    fn begin_buffer_read(self: &Arc<Self>, st: &mut EntityState, path: &Path) -> SharedRead {
        st.reads_in_flight += 1;
        let id = st.next_op();
        let lease = ReadLease::new(Arc::clone(self), path.to_path_buf());
        let task = tokio::spawn(Self::service_buffer_read(lease, id));

        let path = path.to_path_buf();
        let shared = async move {
            task.await.unwrap_or_else(|e| {
                Err(CacheError::TaskFailed {
                    path,
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared();
        st.coalesced = Some((id, shared.clone()));
        shared
    }

    async fn service_buffer_read(
        mut lease: ReadLease,
        id: u64,
    ) -> Result<Option<Bytes>, CacheError> {
        let entity = Arc::clone(&lease.entity);
        let path = lease.path.clone();

        lease.acquire_slots().await;
        entity.emit(&path, CacheEvent::ReadStartFromFile);
        let result = tokio::fs::read(&path).await;

        lease.settle(|st| {
            if st.coalesced.as_ref().is_some_and(|(current, _)| *current == id) {
                st.coalesced = None;
            }

            if let Some(newer) = &st.snapshot {
                entity.emit(&path, CacheEvent::ReadCompleteButMemoryUpdated);
                return Ok(Some(newer.clone()));
            }

            match result {
                Ok(data) => {
                    let bytes = Bytes::from(data);
                    if !st.write_active() {
                        st.set_snapshot(bytes.clone());
                        entity.emit(&path, CacheEvent::MemoryFilledFromFile);
                    }
                    entity.emit(&path, CacheEvent::ReadCompleteFromFile);
                    Ok(Some(bytes))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    entity.emit(&path, CacheEvent::NotCached);
                    Ok(None)
                }
                Err(e) => {
                    warn!(key = %entity.key, path = ?path, error = %e, "cache read failed");
                    entity.emit(&path, CacheEvent::ReadFailed);
                    Err(CacheError::io(&path, e))
                }
            }
        })
    }

    /// Open a chunked read of the file, or of the memory snapshot if there is one.
    pub(crate) async fn read_as_stream(
        self: &Arc<Self>,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Attempt<Option<ReadSession>>, CacheError> {
        let mut lease = loop {
            let woken = {
                let mut st = self.lock();
                if st.retired {
                    return Ok(Attempt::Retired);
                }
                st.last_path = path.to_path_buf();

                if let Some(bytes) = st.snapshot.clone() {
                    self.touch(&mut st);
                    drop(st);
                    self.emit(path, CacheEvent::ReadFromMemory);
                    self.emit(path, CacheEvent::ReadStreamReady);
                    return Ok(Attempt::Done(Some(ReadSession::from_memory(
                        Arc::clone(self),
                        path.to_path_buf(),
                        bytes,
                        chunk_size,
                    ))));
                }

                if !st.write_active() {
                    st.reads_in_flight += 1;
                    self.touch(&mut st);
                    break ReadLease::new(Arc::clone(self), path.to_path_buf());
                }

                self.emit(path, CacheEvent::ReadQueuedBehindWrite);
                st.park()
            };

            let _ = woken.await;
            self.emit(path, CacheEvent::ReadWoken);
        };

        lease.acquire_slots().await;
        self.emit(path, CacheEvent::ReadStartFromFile);
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                self.emit(path, CacheEvent::ReadStreamReady);
                Ok(Attempt::Done(Some(ReadSession::from_file(
                    file, lease, chunk_size,
                ))))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.emit(path, CacheEvent::NotCached);
                Ok(Attempt::Done(None))
            }
            Err(e) => {
                self.emit(path, CacheEvent::ReadFailed);
                Err(CacheError::io(path, e))
            }
        }
    }

    /// Bookkeeping for a finished filesystem read. `f` runs inside the same critical section.
    fn end_read<R>(self: &Arc<Self>, f: impl FnOnce(&mut EntityState) -> R) -> R {
        let mut st = self.lock();
        st.reads_in_flight = st.reads_in_flight.saturating_sub(1);
        let out = f(&mut st);
        self.touch(&mut st);
        self.settle(st);
        out
    }

    // ---------------------------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------------------------

    /// Replace the file's contents with `bytes`.
    pub(crate) async fn write_as_buffer(
        self: &Arc<Self>,
        path: &Path,
        bytes: Bytes,
    ) -> Result<Attempt<WriteOutcome>, CacheError> {
        let reply = {
            let mut st = self.lock();
            if st.retired {
                return Ok(Attempt::Retired);
            }
            st.last_path = path.to_path_buf();
            self.touch(&mut st);

            if !st.file_removed && st.snapshot.as_ref() == Some(&bytes) {
                self.emit(path, CacheEvent::WriteSkippedUnchanged);
                return Ok(Attempt::Done(WriteOutcome::SkippedSameAsMemoryCache));
            }

            self.cancel_pending(&mut st, path);
            st.set_snapshot(bytes.clone());
            self.emit(path, CacheEvent::MemoryUpdated);
            st.wake_parked();
            self.note_queued(&st, path);

            let (tx, rx) = oneshot::channel();
            st.pending = Some(PendingWrite::Buffer {
                bytes,
                path: path.to_path_buf(),
                reply: tx,
            });
            self.pump(&mut st);
            rx
        };

        reply
            .await
            .unwrap_or_else(|_| {
                Err(CacheError::TaskFailed {
                    path: path.to_path_buf(),
                    reason: "write was dropped before it completed".to_owned(),
                })
            })
            .map(Attempt::Done)
    }

    /// Request exclusive streamed write access to the file.
    pub(crate) async fn write_as_stream(
        self: &Arc<Self>,
        path: &Path,
        chunk_size: usize,
        error_timeout: Duration,
    ) -> Result<Attempt<WriteStreamOutcome>, CacheError> {
        let grant = {
            let mut st = self.lock();
            if st.retired {
                return Ok(Attempt::Retired);
            }
            st.last_path = path.to_path_buf();
            self.touch(&mut st);

            self.cancel_pending(&mut st, path);
            st.clear_snapshot();
            self.note_queued(&st, path);

            let (tx, rx) = oneshot::channel();
            st.pending = Some(PendingWrite::Stream {
                path: path.to_path_buf(),
                reply: tx,
            });
            self.pump(&mut st);
            rx
        };

        let mut lease = match grant.await {
            Ok(StreamGrant::Granted(lease)) => lease,
            Ok(StreamGrant::Canceled) => {
                return Ok(Attempt::Done(WriteStreamOutcome::CanceledByNewerRequest));
            }
            Err(_) => {
                return Err(CacheError::TaskFailed {
                    path: path.to_path_buf(),
                    reason: "stream write request was dropped".to_owned(),
                });
            }
        };

        match crate::io::create_truncated(path).await {
            Ok(file) => {
                self.emit(path, CacheEvent::WriteStreamReady);
                Ok(Attempt::Done(WriteStreamOutcome::Opened(WriteSession::new(
                    file,
                    lease,
                    chunk_size,
                    error_timeout,
                ))))
            }
            Err(e) => {
                self.emit(path, CacheEvent::WriteStreamError);
                lease.release(CacheEvent::WriteStreamClosed);
                Err(CacheError::io(path, e))
            }
        }
    }

    fn cancel_pending(&self, st: &mut EntityState, path: &Path) {
        if let Some(pending) = st.pending.take() {
            self.emit(path, CacheEvent::WriteCanceledByNewer);
            pending.cancel();
        }
    }

    fn note_queued(&self, st: &EntityState, path: &Path) {
        if st.reads_in_flight > 0 {
            self.emit(path, CacheEvent::WriteQueuedBehindReads);
        } else if st.write != WriteSlot::Idle {
            self.emit(path, CacheEvent::WriteQueuedBehindWrite);
        }
    }

    /// Start the pending write if nothing else is touching the file.
    fn pump(self: &Arc<Self>, st: &mut EntityState) {
        loop {
            if st.write != WriteSlot::Idle || st.reads_in_flight > 0 {
                return;
            }
            let Some(pending) = st.pending.take() else {
                return;
            };
            let id = st.next_op();

            match pending {
                PendingWrite::Buffer { bytes, path, reply } => {
                    if st.snapshot.as_ref() != Some(&bytes) {
                        st.set_snapshot(bytes.clone());
                        self.emit(&path, CacheEvent::MemoryUpdated);
                    }
                    st.wake_parked();
                    let generation = st.snapshot_gen;

                    let Ok(handle) = tokio::runtime::Handle::try_current() else {
                        warn!(key = %self.key, path = ?path, "no tokio runtime; write dropped");
                        let _ = reply.send(Err(CacheError::TaskFailed {
                            path,
                            reason: "no tokio runtime to run the write on".to_owned(),
                        }));
                        continue;
                    };

                    st.write = WriteSlot::Buffer(id);
                    self.emit(&path, CacheEvent::WriteStart);
                    let this = Arc::clone(self);
                    handle.spawn(async move {
                        let result = crate::io::write_file(&path, &bytes).await;
                        this.finish_buffer_write(id, generation, &path, result, reply);
                    });
                    return;
                }
                PendingWrite::Stream { path, reply } => {
                    st.write = WriteSlot::Stream(id);
                    let lease = WriteLease {
                        entity: Arc::clone(self),
                        id,
                        path,
                        armed: true,
                    };
                    match reply.send(StreamGrant::Granted(lease)) {
                        Ok(()) => return,
                        Err(StreamGrant::Granted(mut lease)) => {
                            // Nobody is waiting for it; dropping an armed lease here would
                            // re-enter this lock.
                            lease.armed = false;
                            st.write = WriteSlot::Idle;
                            self.emit(&lease.path, CacheEvent::WriteStreamAbandoned);
                        }
                        Err(StreamGrant::Canceled) => st.write = WriteSlot::Idle,
                    }
                }
            }
        }
    }

    fn finish_buffer_write(
        self: &Arc<Self>,
        id: u64,
        generation: u64,
        path: &Path,
        result: io::Result<()>,
        reply: oneshot::Sender<Result<WriteOutcome, CacheError>>,
    ) {
        let mut st = self.lock();
        if st.write == WriteSlot::Buffer(id) {
            st.write = WriteSlot::Idle;
        } else {
            warn!(key = %self.key, path = ?path, "buffer write finished without holding the write slot");
        }

        let outcome = match result {
            Ok(()) => {
                st.file_removed = false;
                self.emit(path, CacheEvent::WriteComplete);
                Ok(WriteOutcome::CompletedSuccessfully)
            }
            Err(e) => {
                warn!(key = %self.key, path = ?path, error = %e, "cache write failed");
                self.emit(path, CacheEvent::WriteFailed);
                if st.snapshot_gen == generation {
                    st.clear_snapshot();
                }
                Err(CacheError::io(path, e))
            }
        };
        let _ = reply.send(outcome);

        if st.pending.is_none() {
            self.touch(&mut st);
        }
        self.settle(st);
    }

    /// Release the stream write slot held by `id`. Returns `false` if it was already released.
    fn finish_stream_write(self: &Arc<Self>, id: u64, path: &Path, event: CacheEvent) -> bool {
        let mut st = self.lock();
        if st.write != WriteSlot::Stream(id) {
            return false;
        }
        st.write = WriteSlot::Idle;
        st.file_removed = false;
        self.emit(path, event);

        if st.pending.is_none() {
            self.touch(&mut st);
        }
        self.settle(st);
        true
    }

    // ---------------------------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------------------------

    fn touch(self: &Arc<Self>, st: &mut EntityState) {
        if st.retired {
            return;
        }
        st.memory_timer
            .rearm(self, TimerKind::Memory, self.settings.memory_ttl);
        st.file_timer
            .rearm(self, TimerKind::File, self.settings.file_ttl);
    }

    /// Common tail of every completion: start what can start, wake parked readers, and retire the
    /// entity if it is no longer needed.
    fn settle(self: &Arc<Self>, mut st: MutexGuard<'_, EntityState>) {
        self.pump(&mut st);
        st.wake_parked();
        let retire = st.should_retire();
        drop(st);
        if retire {
            self.retire();
        }
    }

    fn retire(self: &Arc<Self>) {
        let (names, path) = {
            let mut st = self.lock();
            if !st.should_retire() {
                return;
            }
            st.retired = true;
            st.memory_timer.disarm();
            st.file_timer.disarm();
            (st.names.drain().collect::<Vec<_>>(), st.last_path.clone())
        };

        debug!(key = %self.key, path = ?path, "retiring cache entity");
        self.emit(&path, CacheEvent::EntityRetired);
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self, names);
        }
    }

    async fn remove_file(self: Arc<Self>, id: u64, path: PathBuf) {
        let result = match tokio::fs::metadata(&path).await {
            Ok(meta) if EntityKey::from_metadata(&meta) == self.key => {
                tokio::fs::remove_file(&path).await.map(|()| true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        };

        let mut st = self.lock();
        if st.write == WriteSlot::Removing(id) {
            st.write = WriteSlot::Idle;
        }
        match result {
            Ok(true) => {
                st.file_removed = true;
                self.emit(&path, CacheEvent::FileRemoved);
            }
            Ok(false) => {
                st.file_removed = true;
                self.emit(&path, CacheEvent::FileRemoveSkippedReplaced);
            }
            Err(e) => {
                warn!(key = %self.key, path = ?path, error = %e, "failed to remove expired cache file");
                self.emit(&path, CacheEvent::FileRemoveFailed);
            }
        }
        self.settle(st);
    }

    /// Whether the memory snapshot is currently populated.
    #[cfg(test)]
    fn has_snapshot(&self) -> bool {
        self.lock().snapshot.is_some()
    }
}

impl Expire for CacheEntity {
    fn on_timer(self: &Arc<Self>, kind: TimerKind) -> Option<Instant> {
        let mut st = self.lock();
        if st.retired {
            return None;
        }

        let timer = match kind {
            TimerKind::Memory => &mut st.memory_timer,
            TimerKind::File => &mut st.file_timer,
        };
        match timer.poll(Instant::now()) {
            TimerPoll::Sleep(deadline) => return Some(deadline),
            TimerPoll::Stop => return None,
            TimerPoll::Fire => {}
        }

        let path = st.last_path.clone();
        trace!(key = %self.key, path = ?path, ?kind, "idle timer fired");
        match kind {
            TimerKind::Memory => {
                if st.buffer_write_active() {
                    self.emit(&path, CacheEvent::MemoryExpirySkipped);
                } else if st.clear_snapshot() {
                    self.emit(&path, CacheEvent::MemoryExpired);
                }
            }
            TimerKind::File => {
                if st.busy() {
                    self.emit(&path, CacheEvent::FileRemoveSkippedBusy);
                } else {
                    let id = st.next_op();
                    st.write = WriteSlot::Removing(id);
                    self.emit(&path, CacheEvent::FileRemoveStart);
                    tokio::spawn(Arc::clone(self).remove_file(id, path));
                    return None;
                }
            }
        }

        let retire = st.should_retire();
        drop(st);
        if retire {
            self.retire();
        }
        None
    }
}

/// A filesystem read counted in `reads_in_flight`, together with its read slots.
///
/// Settling or dropping the lease releases the slots and then the entity's bookkeeping, exactly
/// once.
pub(crate) struct ReadLease {
    entity: Arc<CacheEntity>,
    path: PathBuf,
    file_slot: Option<ReadSlot>,
    global_slot: Option<ReadSlot>,
    settled: bool,
}

impl ReadLease {
    /// The caller must already have counted the read in `reads_in_flight`.
    fn new(entity: Arc<CacheEntity>, path: PathBuf) -> Self {
        Self {
            entity,
            path,
            file_slot: None,
            global_slot: None,
            settled: false,
        }
    }

    /// Wait for a per-file slot, then a global one.
    async fn acquire_slots(&mut self) {
        let entity = Arc::clone(&self.entity);
        self.file_slot = Some(
            Self::slot_from(&entity.file_reads, || {
                entity.emit(&self.path, CacheEvent::ReadQueuedFileLimit);
            })
            .await,
        );
        self.global_slot = Some(
            Self::slot_from(&entity.settings.global_reads, || {
                entity.emit(&self.path, CacheEvent::ReadQueuedGlobalLimit);
            })
            .await,
        );
    }

    async fn slot_from(limiter: &ReadLimiter, on_queued: impl FnOnce()) -> ReadSlot {
        if let Some(slot) = limiter.try_acquire() {
            return slot;
        }
        on_queued();
        limiter.acquire().await
    }

    pub(crate) fn entity(&self) -> &Arc<CacheEntity> {
        &self.entity
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn settle<R>(mut self, f: impl FnOnce(&mut EntityState) -> R) -> R {
        self.settled = true;
        self.file_slot = None;
        self.global_slot = None;
        let entity = Arc::clone(&self.entity);
        entity.end_read(f)
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.file_slot = None;
        self.global_slot = None;
        self.entity.end_read(|_| ());
    }
}

/// Exclusive right to stream into the file. Released exactly once: explicitly, by the forced
/// finalisation timer, or on drop.
pub(crate) struct WriteLease {
    entity: Arc<CacheEntity>,
    id: u64,
    path: PathBuf,
    armed: bool,
}

impl WriteLease {
    pub(crate) fn entity(&self) -> &Arc<CacheEntity> {
        &self.entity
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Give the write slot back, reporting `event`. No-op if already released.
    pub(crate) fn release(&mut self, event: CacheEvent) {
        if std::mem::take(&mut self.armed) {
            self.entity.finish_stream_write(self.id, &self.path, event);
        }
    }

    /// Release the write slot after `timeout` unless it is released before.
    pub(crate) fn release_after(&self, timeout: Duration) {
        if !self.armed {
            return;
        }
        let entity = Arc::clone(&self.entity);
        let id = self.id;
        let path = self.path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if entity.finish_stream_write(id, &path, CacheEvent::WriteStreamForcedFinalize) {
                debug!(key = %entity.key, path = ?path, "forced finalisation of failed write stream");
            }
        });
    }
}

impl Drop for WriteLease {
    fn drop(&mut self) {
        self.release(CacheEvent::WriteStreamAbandoned);
    }
}
