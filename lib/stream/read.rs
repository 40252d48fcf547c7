use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt as _;
use tracing::warn;

use crate::cache::CacheEntity;
use crate::cache::entity::ReadLease;
use crate::cache::observer::CacheEvent;
use crate::error::{CacheError, IoClass};
use crate::stream::{EndOptions, effective_chunk_size};

type DataHandler = Box<dyn FnMut(&Bytes) + Send>;

enum Source {
    Memory {
        data: Bytes,
        offset: usize,
    },
    File {
        file: Option<File>,
        /// Held until the end of the data.
        lease: Option<ReadLease>,
    },
}

/// A chunked read of one cache file.
///
/// Chunks are pulled with [`next_chunk`](Self::next_chunk); a handler installed with
/// [`on_data`](Self::on_data) additionally sees every chunk the session reads. The file's read
/// slots are released as soon as the end of the data is reached, the session fails, or it is
/// ended or dropped.
pub struct ReadSession {
    entity: Arc<CacheEntity>,
    path: PathBuf,
    source: Source,
    chunk_size: usize,
    handler: Option<DataHandler>,
    failure: Option<Arc<io::Error>>,
    exhausted: bool,
}

impl ReadSession {
    pub(crate) fn from_memory(
        entity: Arc<CacheEntity>,
        path: PathBuf,
        data: Bytes,
        chunk_size: usize,
    ) -> Self {
        Self {
            entity,
            path,
            source: Source::Memory { data, offset: 0 },
            chunk_size: effective_chunk_size(chunk_size),
            handler: None,
            failure: None,
            exhausted: false,
        }
    }

    pub(crate) fn from_file(file: File, lease: ReadLease, chunk_size: usize) -> Self {
        Self {
            entity: Arc::clone(lease.entity()),
            path: lease.path().to_path_buf(),
            source: Source::File {
                file: Some(file),
                lease: Some(lease),
            },
            chunk_size: effective_chunk_size(chunk_size),
            handler: None,
            failure: None,
            exhausted: false,
        }
    }

    /// The file being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the data comes from the memory snapshot rather than the file.
    #[must_use]
    pub fn is_from_memory(&self) -> bool {
        matches!(self.source, Source::Memory { .. })
    }

    /// Deliver every chunk this session reads to `handler`, replacing any previous handler.
    pub fn on_data(&mut self, handler: impl FnMut(&Bytes) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Read the next chunk of at most the session's chunk size. `None` marks the end of the data.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CacheError> {
        if let Some(source) = &self.failure {
            return Err(CacheError::SessionFailed {
                path: self.path.clone(),
                source: Arc::clone(source),
            });
        }
        if self.exhausted {
            return Ok(None);
        }

        let read = match &mut self.source {
            Source::Memory { data, offset } => {
                let end = (*offset + self.chunk_size).min(data.len());
                let chunk = data.slice(*offset..end);
                *offset = end;
                Ok(chunk)
            }
            Source::File {
                file: Some(file), ..
            } => {
                let mut buf = vec![0; self.chunk_size];
                file.read(&mut buf).await.map(|n| {
                    buf.truncate(n);
                    Bytes::from(buf)
                })
            }
            Source::File { file: None, .. } => Ok(Bytes::new()),
        };

        let chunk = match read {
            Ok(chunk) => chunk,
            Err(e) => return Err(self.fail(e)),
        };
        if chunk.is_empty() {
            self.finish();
            return Ok(None);
        }

        self.entity.emit(&self.path, CacheEvent::ReadStreamChunk);
        if let Some(handler) = &mut self.handler {
            handler(&chunk);
        }
        Ok(Some(chunk))
    }

    /// End the session.
    ///
    /// Unless `remove_data_handler` is set, the remaining data is first delivered to the data
    /// handler, if there is one; otherwise it is discarded. With `wait_for_close` this resolves
    /// only once the file handle has been closed. Fails with the session's error if it failed.
    pub async fn end(mut self, options: EndOptions) -> Result<(), CacheError> {
        if options.remove_data_handler {
            self.handler = None;
        }
        if self.handler.is_some() {
            while self.next_chunk().await?.is_some() {}
        } else if !self.exhausted && self.failure.is_none() {
            self.finish();
        }

        if let Some(source) = self.failure.take() {
            return Err(CacheError::SessionFailed {
                path: self.path.clone(),
                source,
            });
        }

        let file = match &mut self.source {
            Source::File { file, .. } => file.take(),
            Source::Memory { .. } => None,
        };
        if let Some(file) = file {
            if options.wait_for_close {
                crate::io::close_file(file)
                    .await
                    .map_err(|e| CacheError::io(&self.path, e))?;
            } else {
                drop(file);
            }
        }
        self.entity.emit(&self.path, CacheEvent::ReadStreamClosed);
        Ok(())
    }

    /// Adapt the session into a [`Stream`] of chunks. The stream stops after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, CacheError>> + Send {
        futures::stream::unfold(Some(self), |session| async move {
            let Some(mut session) = session else {
                return None;
            };
            match session.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(session))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn finish(&mut self) {
        self.exhausted = true;
        self.entity.emit(&self.path, CacheEvent::ReadStreamComplete);
        if let Source::File { lease, .. } = &mut self.source {
            drop(lease.take());
        }
    }

    fn fail(&mut self, error: io::Error) -> CacheError {
        warn!(path = ?self.path, error = %error, "read stream failed");
        self.entity.emit(&self.path, CacheEvent::ReadStreamError);
        if let Source::File { file, lease } = &mut self.source {
            drop(lease.take());
            drop(file.take());
        }

        let source = Arc::new(error);
        self.failure = Some(Arc::clone(&source));
        CacheError::Io {
            path: self.path.clone(),
            class: IoClass::of(&source),
            source,
        }
    }
}
