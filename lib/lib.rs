//! ttl-fcache shared library.

/// Per-file coordination, read limits, idle timers and observability.
pub mod cache;
/// The cache directory facade.
pub mod directory;
/// Error types.
pub mod error;
/// File identity and name handling.
pub mod fs;
pub mod io;
/// Chunked read and write sessions.
pub mod stream;

pub use cache::WriteOutcome;
pub use cache::limiter::ReadLimiter;
pub use cache::observer::{CacheEvent, CacheObserver};
pub use directory::{CacheDirectory, CacheOptions};
pub use error::{CacheError, IoClass, OpenDirectoryError};
pub use fs::EntityKey;
pub use stream::{EndOptions, ReadSession, WriteSession, WriteStreamOutcome};
