use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt as _, BufWriter};
use tracing::{debug, warn};

use crate::cache::entity::WriteLease;
use crate::cache::observer::CacheEvent;
use crate::error::{CacheError, IoClass};
use crate::stream::{EndOptions, effective_chunk_size};

/// Result of [`CacheDirectory::write_as_stream`](crate::CacheDirectory::write_as_stream).
pub enum WriteStreamOutcome {
    /// The caller now has exclusive write access to the file.
    Opened(WriteSession),
    /// A newer write arrived before this one started.
    CanceledByNewerRequest,
}

impl WriteStreamOutcome {
    /// The session, if one was opened.
    #[must_use]
    pub fn into_session(self) -> Option<WriteSession> {
        match self {
            Self::Opened(session) => Some(session),
            Self::CanceledByNewerRequest => None,
        }
    }
}

/// Exclusive, buffered write access to one cache file.
///
/// While a session is alive no other read or write touches the file. The slot is given back when
/// the session is ended or dropped, or, if the session failed, at most `error_timeout` after the
/// failure.
pub struct WriteSession {
    writer: Option<BufWriter<File>>,
    lease: WriteLease,
    buffer_size: usize,
    error_timeout: Duration,
    failure: Option<Arc<io::Error>>,
}

impl WriteSession {
    pub(crate) fn new(
        file: File,
        lease: WriteLease,
        chunk_size: usize,
        error_timeout: Duration,
    ) -> Self {
        let buffer_size = effective_chunk_size(chunk_size);
        Self {
            writer: Some(BufWriter::with_capacity(buffer_size, file)),
            lease,
            buffer_size,
            error_timeout,
            failure: None,
        }
    }

    /// The file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.lease.path()
    }

    /// Queue `chunk` for writing. Resolves once the chunk is buffered, which may require
    /// draining the buffer to the file first.
    pub async fn write(&mut self, chunk: impl AsRef<[u8]>) -> Result<(), CacheError> {
        self.check_failed()?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(self.closed());
        };

        let chunk = chunk.as_ref();
        if writer.buffer().len() + chunk.len() > self.buffer_size {
            self.lease
                .entity()
                .emit(self.lease.path(), CacheEvent::WriteStreamBufferFull);
        }

        match writer.write_all(chunk).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Flush and end the session.
    ///
    /// With `wait_for_close` this resolves only once the file handle has been closed, and the
    /// close is bounded by the session's error timeout. Otherwise the file is released to other
    /// operations as soon as the data is flushed and the handle closes in the background.
    pub async fn end(mut self, options: EndOptions) -> Result<(), CacheError> {
        self.check_failed()?;
        let Some(mut writer) = self.writer.take() else {
            return Err(self.closed());
        };

        if let Err(e) = writer.flush().await {
            return Err(self.fail(e));
        }
        let path = self.lease.path().to_path_buf();
        let file = writer.into_inner();
        if !options.wait_for_close {
            let entity = Arc::clone(self.lease.entity());
            self.lease.release(CacheEvent::WriteStreamFlushed);
            tokio::spawn(async move {
                match crate::io::close_file(file).await {
                    Ok(()) => entity.emit(&path, CacheEvent::WriteStreamClosed),
                    Err(e) => warn!(path = ?path, error = %e, "closing write stream failed"),
                }
            });
            return Ok(());
        }

        self.lease
            .entity()
            .emit(&path, CacheEvent::WriteStreamFlushed);
        match tokio::time::timeout(self.error_timeout, crate::io::close_file(file)).await {
            Ok(Ok(())) => {
                self.lease.release(CacheEvent::WriteStreamClosed);
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => {
                debug!(path = ?path, timeout = ?self.error_timeout, "write stream close timed out");
                let error = self.fail(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "closing the write stream timed out",
                ));
                self.lease.release(CacheEvent::WriteStreamForcedFinalize);
                Err(error)
            }
        }
    }

    fn check_failed(&self) -> Result<(), CacheError> {
        match &self.failure {
            Some(source) => Err(CacheError::SessionFailed {
                path: self.lease.path().to_path_buf(),
                source: Arc::clone(source),
            }),
            None => Ok(()),
        }
    }

    fn closed(&self) -> CacheError {
        CacheError::io(
            self.lease.path(),
            io::Error::new(io::ErrorKind::BrokenPipe, "write stream already ended"),
        )
    }

    /// Record the first failure and arm the forced finalisation.
    fn fail(&mut self, error: io::Error) -> CacheError {
        warn!(path = ?self.lease.path(), error = %error, "write stream failed");
        self.lease
            .entity()
            .emit(self.lease.path(), CacheEvent::WriteStreamError);
        self.lease.release_after(self.error_timeout);

        let source = Arc::new(error);
        self.failure = Some(Arc::clone(&source));
        CacheError::Io {
            path: self.lease.path().to_path_buf(),
            class: IoClass::of(&source),
            source,
        }
    }
}
