//! Chunked access to cache files.
//!
//! Stream sessions are handed out by
//! [`CacheDirectory::read_as_stream`](crate::CacheDirectory::read_as_stream) and
//! [`CacheDirectory::write_as_stream`](crate::CacheDirectory::write_as_stream). A session holds
//! its file's read slots or write slot until it is ended or dropped.

/// Chunked reads.
pub mod read;
/// Chunked writes.
pub mod write;

pub use read::ReadSession;
pub use write::{WriteSession, WriteStreamOutcome};

/// Chunk size used when the caller passes zero.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) fn effective_chunk_size(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        requested
    }
}

/// How a session should be ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndOptions {
    /// Resolve only after the file handle has been closed, instead of as soon as the data is
    /// complete.
    pub wait_for_close: bool,
    /// Read sessions only: detach the data handler and discard the rest of the data instead of
    /// delivering it.
    pub remove_data_handler: bool,
}

impl EndOptions {
    /// Wait for the file handle to close before resolving.
    #[must_use]
    pub fn wait_for_close(mut self, yes: bool) -> Self {
        self.wait_for_close = yes;
        self
    }

    /// Discard the remaining data instead of delivering it to the data handler.
    #[must_use]
    pub fn remove_data_handler(mut self, yes: bool) -> Self {
        self.remove_data_handler = yes;
        self
    }
}
