//! Structured state-transition events.
//!
//! Every transition of a per-file cache entity is reported through `emit`, which
//! logs it with `tracing` and forwards it to the directory's [`CacheObserver`], if one is
//! installed. Nothing in the cache depends on the observer being present.

use std::path::Path;
use std::sync::Arc;

use crate::fs::identity::EntityKey;

/// A state transition inside the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CacheEvent {
    /// A read was answered from the memory snapshot.
    ReadFromMemory,
    /// A buffer read joined a read of the same file already in flight.
    ReadJoinedInFlight,
    /// A read was parked until the in-flight or pending write lands.
    ReadQueuedBehindWrite,
    /// A parked read was woken by a snapshot update or a finished write.
    ReadWoken,
    /// A filesystem read was started.
    ReadStartFromFile,
    /// A read had to wait for a per-file read slot.
    ReadQueuedFileLimit,
    /// A read had to wait for a global read slot.
    ReadQueuedGlobalLimit,
    /// A filesystem read finished and its bytes were returned.
    ReadCompleteFromFile,
    /// A filesystem read finished, but a newer write had updated the snapshot meanwhile; the
    /// snapshot was returned instead.
    ReadCompleteButMemoryUpdated,
    /// The memory snapshot was filled from a filesystem read.
    MemoryFilledFromFile,
    /// Neither a memory snapshot nor a file existed.
    NotCached,
    /// The filesystem read failed.
    ReadFailed,

    /// The write carried the same bytes as the snapshot and was skipped.
    WriteSkippedUnchanged,
    /// A pending write was superseded by a newer request.
    WriteCanceledByNewer,
    /// A write was queued behind in-flight reads.
    WriteQueuedBehindReads,
    /// A write was queued behind the in-flight write.
    WriteQueuedBehindWrite,
    /// The memory snapshot was updated by a write.
    MemoryUpdated,
    /// A physical buffer write started.
    WriteStart,
    /// A physical buffer write finished.
    WriteComplete,
    /// A physical buffer write failed.
    WriteFailed,

    /// A read session was handed to the caller.
    ReadStreamReady,
    /// A read session delivered a chunk.
    ReadStreamChunk,
    /// A read session reached the end of the data.
    ReadStreamComplete,
    /// A read session's file handle was closed.
    ReadStreamClosed,
    /// A read session failed.
    ReadStreamError,
    /// A write session was handed to the caller.
    WriteStreamReady,
    /// A write session's internal buffer was full and had to drain.
    WriteStreamBufferFull,
    /// A write session flushed all data.
    WriteStreamFlushed,
    /// A write session's file handle was closed.
    WriteStreamClosed,
    /// A write session failed.
    WriteStreamError,
    /// A failed write session was finalised by its error timeout.
    WriteStreamForcedFinalize,
    /// A write session was abandoned without being ended.
    WriteStreamAbandoned,

    /// The memory TTL expired and the snapshot was dropped.
    MemoryExpired,
    /// The memory TTL expired while a write was active; the snapshot was kept.
    MemoryExpirySkipped,
    /// The file TTL expired and the file is being deleted.
    FileRemoveStart,
    /// The file was deleted.
    FileRemoved,
    /// The file TTL expired while an operation was in flight; deletion was skipped.
    FileRemoveSkippedBusy,
    /// The file was deleted or replaced by someone else; nothing was removed.
    FileRemoveSkippedReplaced,
    /// Deleting the file failed.
    FileRemoveFailed,

    /// A name now refers to a different file identity.
    NameRelinked,
    /// The entity was dropped from the registry.
    EntityRetired,
}

/// Receives every [`CacheEvent`] emitted by a cache directory.
pub trait CacheObserver: Send + Sync + 'static {
    /// Called synchronously, possibly while entity state is locked. Must not block and must not
    /// call back into the cache.
    fn on_event(&self, key: EntityKey, path: &Path, event: CacheEvent);
}

/// Log `event` and forward it to `observer`.
pub(crate) fn emit(
    observer: Option<&Arc<dyn CacheObserver>>,
    key: EntityKey,
    path: &Path,
    event: CacheEvent,
) {
    tracing::debug!(key = %key, path = ?path, ?event, "cache transition");
    if let Some(observer) = observer {
        observer.on_event(key, path, event);
    }
}
