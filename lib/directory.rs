//! The cache directory facade.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::cache::WriteOutcome;
use crate::cache::entity::Attempt;
use crate::cache::limiter::{DEFAULT_FILE_READS, ReadLimiter};
use crate::cache::observer::CacheObserver;
use crate::error::{CacheError, OpenDirectoryError};
use crate::fs::identity::{Intent, Registry, Resolved};
use crate::stream::{ReadSession, WriteStreamOutcome};

/// Default idle time after which a memory snapshot is dropped.
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(100);

/// Default idle time after which a cache file is deleted.
pub const DEFAULT_FILE_TTL: Duration = Duration::from_secs(600);

/// Default time a failed write stream may hold on to its file.
pub const DEFAULT_WRITE_STREAM_ERROR_TIMEOUT: Duration = Duration::from_secs(3);

/// Tuning knobs of a [`CacheDirectory`].
#[derive(Clone)]
pub struct CacheOptions {
    memory_ttl: Duration,
    file_ttl: Duration,
    max_file_reads: usize,
    write_stream_error_timeout: Duration,
    read_limiter: Option<Arc<ReadLimiter>>,
    observer: Option<Arc<dyn CacheObserver>>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            memory_ttl: DEFAULT_MEMORY_TTL,
            file_ttl: DEFAULT_FILE_TTL,
            max_file_reads: DEFAULT_FILE_READS,
            write_stream_error_timeout: DEFAULT_WRITE_STREAM_ERROR_TIMEOUT,
            read_limiter: None,
            observer: None,
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("memory_ttl", &self.memory_ttl)
            .field("file_ttl", &self.file_ttl)
            .field("max_file_reads", &self.max_file_reads)
            .field("write_stream_error_timeout", &self.write_stream_error_timeout)
            .field("read_limiter", &self.read_limiter)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl CacheOptions {
    /// Idle time after which a file's memory snapshot is dropped.
    #[must_use]
    pub fn with_memory_ttl(mut self, ttl: Duration) -> Self {
        self.memory_ttl = ttl;
        self
    }

    /// Idle time after which a cache file is deleted from disk.
    #[must_use]
    pub fn with_file_ttl(mut self, ttl: Duration) -> Self {
        self.file_ttl = ttl;
        self
    }

    /// Maximum number of concurrently open reads against a single file.
    #[must_use]
    pub fn with_max_file_reads(mut self, max: usize) -> Self {
        self.max_file_reads = max;
        self
    }

    /// Default time a failed write stream may keep its file before it is released.
    #[must_use]
    pub fn with_write_stream_error_timeout(mut self, timeout: Duration) -> Self {
        self.write_stream_error_timeout = timeout;
        self
    }

    /// Bound reads with `limiter` instead of the process-wide [`ReadLimiter::global`].
    #[must_use]
    pub fn with_read_limiter(mut self, limiter: Arc<ReadLimiter>) -> Self {
        self.read_limiter = Some(limiter);
        self
    }

    /// Report every state transition to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The memory TTL.
    #[must_use]
    pub fn memory_ttl(&self) -> Duration {
        self.memory_ttl
    }

    /// The file TTL.
    #[must_use]
    pub fn file_ttl(&self) -> Duration {
        self.file_ttl
    }

    /// The per-file read limit.
    #[must_use]
    pub fn max_file_reads(&self) -> usize {
        self.max_file_reads
    }

    /// The default write-stream error timeout.
    #[must_use]
    pub fn write_stream_error_timeout(&self) -> Duration {
        self.write_stream_error_timeout
    }

    pub(crate) fn into_settings(self) -> Settings {
        Settings {
            memory_ttl: self.memory_ttl,
            file_ttl: self.file_ttl,
            max_file_reads: self.max_file_reads,
            write_stream_error_timeout: self.write_stream_error_timeout,
            global_reads: self.read_limiter.unwrap_or_else(ReadLimiter::global),
            observer: self.observer,
        }
    }
}

/// Resolved options shared by every entity of one directory.
pub(crate) struct Settings {
    pub memory_ttl: Duration,
    pub file_ttl: Duration,
    pub max_file_reads: usize,
    pub write_stream_error_timeout: Duration,
    pub global_reads: Arc<ReadLimiter>,
    pub observer: Option<Arc<dyn CacheObserver>>,
}

/// A directory of cached files.
///
/// Files are addressed by plain names relative to the directory. Each file's contents are kept in
/// memory for `memory_ttl` after its last access and on disk for `file_ttl`.
pub struct CacheDirectory {
    registry: Arc<Registry>,
}

impl CacheDirectory {
    /// Open the cache directory at the absolute `path`, creating it if `create_if_missing`.
    pub async fn open(
        path: impl AsRef<Path>,
        create_if_missing: bool,
        options: CacheOptions,
    ) -> Result<Self, OpenDirectoryError> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(OpenDirectoryError::NotAbsolute(path.to_path_buf()));
        }

        let root = match tokio::fs::canonicalize(path).await {
            Ok(root) => root,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !create_if_missing {
                    return Err(OpenDirectoryError::Missing(path.to_path_buf()));
                }
                debug!(path = ?path, "creating cache directory");
                tokio::fs::create_dir_all(path).await?;
                tokio::fs::canonicalize(path).await?
            }
            Err(e) => return Err(e.into()),
        };

        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(OpenDirectoryError::NotADirectory(root));
        }

        info!(
            path = ?root,
            memory_ttl = ?options.memory_ttl,
            file_ttl = ?options.file_ttl,
            "opened cache directory"
        );
        let settings = Arc::new(options.into_settings());
        Ok(Self {
            registry: Registry::new(root, settings),
        })
    }

    /// The canonical path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.registry.root()
    }

    /// The limiter bounding this directory's concurrent reads.
    #[must_use]
    pub fn read_limiter(&self) -> &Arc<ReadLimiter> {
        &self.registry.settings().global_reads
    }

    /// Number of files currently tracked.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.registry.entity_count()
    }

    /// The full path of the cache file `name`. Does not validate the name.
    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.registry.root().join(name)
    }

    /// Read the whole of `name`. `None` if it is neither in memory nor on disk.
    pub async fn read_as_buffer(&self, name: &str) -> Result<Option<Bytes>, CacheError> {
        loop {
            let Some(resolved) = self.registry.resolve(name, Intent::Read).await? else {
                return Ok(None);
            };
            match resolved.entity.read_as_buffer(&resolved.path).await? {
                Attempt::Done(bytes) => return Ok(bytes),
                Attempt::Retired => trace!(name, "entity retired before the read, resolving again"),
            }
        }
    }

    /// Replace the contents of `name` with `bytes`.
    ///
    /// The new contents are visible to readers immediately; the returned future resolves once
    /// they are on disk, or once a newer write superseded this one.
    pub async fn write_as_buffer(
        &self,
        name: &str,
        bytes: impl Into<Bytes>,
    ) -> Result<WriteOutcome, CacheError> {
        let bytes = bytes.into();
        loop {
            let resolved = self.resolve_for_write(name).await?;
            match resolved.entity.write_as_buffer(&resolved.path, bytes.clone()).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Retired => trace!(name, "entity retired before the write, resolving again"),
            }
        }
    }

    /// Read `name` in chunks of at most `chunk_size` bytes. `None` if it does not exist.
    pub async fn read_as_stream(
        &self,
        name: &str,
        chunk_size: usize,
    ) -> Result<Option<ReadSession>, CacheError> {
        loop {
            let Some(resolved) = self.registry.resolve(name, Intent::Read).await? else {
                return Ok(None);
            };
            match resolved
                .entity
                .read_as_stream(&resolved.path, chunk_size)
                .await?
            {
                Attempt::Done(session) => return Ok(session),
                Attempt::Retired => trace!(name, "entity retired before the read, resolving again"),
            }
        }
    }

    /// Obtain exclusive streamed write access to `name`.
    ///
    /// `error_timeout` overrides the directory's write-stream error timeout for this session.
    pub async fn write_as_stream(
        &self,
        name: &str,
        chunk_size: usize,
        error_timeout: Option<Duration>,
    ) -> Result<WriteStreamOutcome, CacheError> {
        let error_timeout =
            error_timeout.unwrap_or(self.registry.settings().write_stream_error_timeout);
        loop {
            let resolved = self.resolve_for_write(name).await?;
            match resolved
                .entity
                .write_as_stream(&resolved.path, chunk_size, error_timeout)
                .await?
            {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Retired => trace!(name, "entity retired before the write, resolving again"),
            }
        }
    }

    async fn resolve_for_write(&self, name: &str) -> Result<Resolved, CacheError> {
        self.registry
            .resolve(name, Intent::Write)
            .await?
            .ok_or_else(|| {
                CacheError::io(
                    &self.file_path(name),
                    io::Error::from(io::ErrorKind::NotFound),
                )
            })
    }
}
