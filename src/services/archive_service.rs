//! Whole-container download as a streamed tar archive.
//!
//! The container listing becomes a directory tree. An initializer task walks
//! it depth-first and queues every entry for the archiver, which runs on a
//! blocking worker because `tar::Builder` writes synchronously. Each file is read
//! through its own [`DownloadProxy`]; the archive bytes flow out through a
//! bounded queue drained by the HTTP response.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use tar::{EntryType, Header};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::download_service::{DownloadProxy, DownloadRequest};
use super::swift::{ObjectBackend, list_all};
use crate::config::TransferLimits;
use crate::errors::{TransferError, TransferResult};
use crate::models::account::SwiftAccount;
use crate::models::archive::{ArchiveNode, DIRECTORY_MODE, FILE_MODE, build_tree, depth_first};

/// An entry waiting for the archiver. A file's download starts only when
/// it is dequeued.
enum PendingEntry {
    Directory {
        path: String,
    },
    File {
        /// Entry path inside the archive.
        path: String,
        /// Object name on the backend.
        object: String,
    },
}

pub struct ArchiveProxy {
    chunks: mpsc::Receiver<TransferResult<Bytes>>,
}

/// Listing-normalized path for every file object, first name wins.
fn object_names(names: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for name in names.iter().filter(|name| !name.ends_with('/')) {
        let path = name
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        if !path.is_empty() {
            out.entry(path).or_insert_with(|| name.clone());
        }
    }
    out
}

impl ArchiveProxy {
    /// List `container` and start streaming it as a tar archive.
    pub async fn begin(
        backend: Arc<dyn ObjectBackend>,
        account: SwiftAccount,
        container: String,
        limits: TransferLimits,
    ) -> TransferResult<Self> {
        let listing = list_all(backend.as_ref(), &account, &container, None).await?;
        match listing.status {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(TransferError::SourceNotFound {
                    container,
                    object: String::new(),
                    status: 404,
                });
            }
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                return Err(TransferError::ContainerAccess {
                    container,
                    status: listing.status.as_u16(),
                });
            }
            s => {
                return Err(TransferError::Listing {
                    container,
                    status: s.as_u16(),
                });
            }
        }

        let tree = build_tree(&listing.names);
        let names = object_names(&listing.names);
        let entries: Vec<PendingEntry> = depth_first(&tree)
            .into_iter()
            .map(|node| match node {
                ArchiveNode::Directory { path, .. } => PendingEntry::Directory { path: path.clone() },
                ArchiveNode::File { path } => PendingEntry::File {
                    path: path.clone(),
                    object: names.get(path).cloned().unwrap_or_else(|| path.clone()),
                },
            })
            .collect();
        tracing::info!(
            %container,
            entries = entries.len(),
            files = entries.iter().filter(|e| matches!(e, PendingEntry::File { .. })).count(),
            "starting container archive"
        );

        let (entry_tx, entry_rx) = mpsc::channel::<PendingEntry>(limits.archive_queue.max(1));
        let (out_tx, chunks) = mpsc::channel(limits.proxy_queue.max(1));

        tokio::spawn(async move {
            for entry in entries {
                if entry_tx.send(entry).await.is_err() {
                    break;
                }
            }
        });

        let archiver = Archiver {
            handle: Handle::current(),
            backend,
            account,
            container,
            limits,
        };
        tokio::task::spawn_blocking(move || {
            let writer = QueueWriter::new(out_tx.clone(), limits.download_chunk);
            if let Err(err) = archiver.run(writer, entry_rx) {
                tracing::warn!(container = %archiver.container, error = %err, "archive aborted");
                let _ = out_tx.blocking_send(Err(err));
            }
        });

        Ok(Self { chunks })
    }

    /// Next archive chunk, `None` once the archive is complete.
    pub async fn read_chunk(&mut self) -> Option<TransferResult<Bytes>> {
        self.chunks.recv().await
    }

    pub fn into_body(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut proxy| async move {
            let chunk = proxy.read_chunk().await?;
            Some((chunk.map_err(io::Error::other), proxy))
        })
    }
}

struct Archiver {
    handle: Handle,
    backend: Arc<dyn ObjectBackend>,
    account: SwiftAccount,
    container: String,
    limits: TransferLimits,
}

impl Archiver {
    fn run(
        &self,
        writer: QueueWriter,
        mut entries: mpsc::Receiver<PendingEntry>,
    ) -> TransferResult<()> {
        let mut builder = tar::Builder::new(writer);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        while let Some(entry) = entries.blocking_recv() {
            let (path, object) = match entry {
                PendingEntry::Directory { path } => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(DIRECTORY_MODE);
                    header.set_mtime(now);
                    header.set_size(0);
                    builder.append_data(&mut header, format!("{path}/"), io::empty())?;
                    continue;
                }
                PendingEntry::File { path, object } => (path, object),
            };

            let mut proxy = DownloadProxy::begin_on(
                &self.handle,
                self.backend.clone(),
                DownloadRequest {
                    account: self.account.clone(),
                    container: self.container.clone(),
                    object: object.clone(),
                    range: None,
                    chunk_size: self.limits.download_chunk,
                    queue_depth: self.limits.proxy_queue,
                },
            );
            let meta = proxy.blocking_metadata()?;
            let size = meta.size.ok_or_else(|| {
                TransferError::Archive(format!("size of `{object}` unknown"))
            })?;

            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(FILE_MODE);
            header.set_mtime(meta.mtime);
            header.set_size(size);
            tracing::debug!(%path, size, "archiving file");
            builder.append_data(&mut header, &path, proxy.into_reader())?;
        }

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        Ok(())
    }
}

/// Blocking [`Write`] that cuts the archive into queue-sized chunks.
struct QueueWriter {
    tx: mpsc::Sender<TransferResult<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
}

impl QueueWriter {
    fn new(tx: mpsc::Sender<TransferResult<Bytes>>, chunk_size: usize) -> Self {
        Self {
            tx,
            buffer: BytesMut::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    fn send(&self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader went away"))
    }
}

impl Write for QueueWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.send(chunk)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.send(chunk)?;
        }
        Ok(())
    }
}
