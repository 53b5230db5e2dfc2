//! Single-object download proxy.
//!
//! A background task issues the backend read, reports the object metadata
//! once headers arrive, then re-chunks the body into a bounded queue. The
//! queue can be drained asynchronously (HTTP responses) or through a
//! blocking [`Read`] adapter (the archive writer thread). A closed queue
//! marks the end of the object.

use std::io::{self, Read};
use std::sync::Arc;

use axum::http::StatusCode;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use super::swift::{BackendResponse, ObjectBackend};
use crate::errors::{TransferError, TransferResult};
use crate::models::account::SwiftAccount;

pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// Response metadata of a proxied object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub status: StatusCode,
    pub content_type: String,
    pub size: Option<u64>,
    /// Entity tag, without quotes.
    pub checksum: String,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
    pub content_range: Option<String>,
}

impl ObjectMeta {
    fn from_response(container: &str, object: &str, resp: &BackendResponse) -> TransferResult<Self> {
        let checksum = resp
            .header("etag")
            .map(|etag| etag.trim_matches('"').to_string())
            .filter(|etag| !etag.is_empty())
            .ok_or_else(|| TransferError::MissingEtag {
                container: container.to_string(),
                object: object.to_string(),
            })?;

        let mtime = resp
            .header("x-timestamp")
            .and_then(|ts| ts.parse::<f64>().ok())
            .map(|ts| ts as u64)
            .or_else(|| {
                resp.header("last-modified")
                    .and_then(|lm| chrono::DateTime::parse_from_rfc2822(lm).ok())
                    .map(|dt| dt.timestamp().max(0) as u64)
            })
            .unwrap_or(0);

        Ok(Self {
            status: resp.status,
            content_type: resp
                .header("content-type")
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            size: resp.header("content-length").and_then(|v| v.parse().ok()),
            checksum,
            mtime,
            content_range: resp.header("content-range").map(str::to_string),
        })
    }
}

/// Which object to read and how to queue it.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub account: SwiftAccount,
    pub container: String,
    pub object: String,
    pub range: Option<String>,
    pub chunk_size: usize,
    pub queue_depth: usize,
}

pub struct DownloadProxy {
    meta_rx: Option<oneshot::Receiver<TransferResult<ObjectMeta>>>,
    meta: Option<ObjectMeta>,
    chunks: mpsc::Receiver<TransferResult<Bytes>>,
}

impl DownloadProxy {
    /// Start the background read on the current runtime.
    pub fn begin(backend: Arc<dyn ObjectBackend>, request: DownloadRequest) -> Self {
        Self::begin_on(&Handle::current(), backend, request)
    }

    /// Start the background read on `handle`, usable from worker threads.
    pub fn begin_on(
        handle: &Handle,
        backend: Arc<dyn ObjectBackend>,
        request: DownloadRequest,
    ) -> Self {
        let (meta_tx, meta_rx) = oneshot::channel();
        let (chunk_tx, chunks) = mpsc::channel(request.queue_depth.max(1));
        handle.spawn(read_object(backend, request, meta_tx, chunk_tx));
        Self {
            meta_rx: Some(meta_rx),
            meta: None,
            chunks,
        }
    }

    fn settle(
        &mut self,
        received: Result<TransferResult<ObjectMeta>, oneshot::error::RecvError>,
    ) -> TransferResult<ObjectMeta> {
        self.meta_rx = None;
        let meta = received.map_err(|_| {
            TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "download ended before headers",
            ))
        })??;
        self.meta = Some(meta.clone());
        Ok(meta)
    }

    /// Wait for the response headers.
    pub async fn metadata(&mut self) -> TransferResult<ObjectMeta> {
        if let Some(meta) = &self.meta {
            return Ok(meta.clone());
        }
        let received = match self.meta_rx.as_mut() {
            Some(rx) => rx.await,
            None => return Err(TransferError::Cancelled),
        };
        self.settle(received)
    }

    /// Blocking variant of [`metadata`](Self::metadata) for worker threads.
    pub fn blocking_metadata(&mut self) -> TransferResult<ObjectMeta> {
        if let Some(meta) = &self.meta {
            return Ok(meta.clone());
        }
        let received = match self.meta_rx.take() {
            Some(rx) => rx.blocking_recv(),
            None => return Err(TransferError::Cancelled),
        };
        self.settle(received)
    }

    /// Next queued chunk, `None` at the end of the object.
    pub async fn read_chunk(&mut self) -> Option<TransferResult<Bytes>> {
        self.chunks.recv().await
    }

    /// Body stream for an HTTP response.
    pub fn into_body(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut proxy| async move {
            let chunk = proxy.read_chunk().await?;
            Some((chunk.map_err(io::Error::other), proxy))
        })
    }

    /// Blocking reader for worker threads.
    pub fn into_reader(self) -> BlockingReader {
        BlockingReader {
            chunks: self.chunks,
            current: Bytes::new(),
        }
    }
}

async fn read_object(
    backend: Arc<dyn ObjectBackend>,
    request: DownloadRequest,
    meta_tx: oneshot::Sender<TransferResult<ObjectMeta>>,
    chunk_tx: mpsc::Sender<TransferResult<Bytes>>,
) {
    let DownloadRequest {
        account,
        container,
        object,
        range,
        chunk_size,
        ..
    } = request;

    let resp = match backend
        .get_object(&account, &container, &object, range.as_deref())
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            let _ = meta_tx.send(Err(err.into()));
            return;
        }
    };

    if !resp.status.is_success() {
        let status = resp.status.as_u16();
        let err = match resp.status {
            StatusCode::UNAUTHORIZED => TransferError::Unauthorized("storage token rejected".into()),
            StatusCode::FORBIDDEN => TransferError::ContainerAccess { container, status },
            _ => TransferError::SourceNotFound {
                container,
                object,
                status,
            },
        };
        let _ = meta_tx.send(Err(err));
        return;
    }

    let meta = match ObjectMeta::from_response(&container, &object, &resp) {
        Ok(meta) => meta,
        Err(err) => {
            tracing::warn!(%container, %object, error = %err, "refusing download");
            let _ = meta_tx.send(Err(err));
            return;
        }
    };
    if meta_tx.send(Ok(meta)).is_err() {
        return;
    }

    let chunk_size = chunk_size.max(1);
    let mut body = resp.body;
    let mut buffer = BytesMut::new();
    while let Some(part) = body.next().await {
        match part {
            Ok(part) => {
                buffer.extend_from_slice(&part);
                while buffer.len() >= chunk_size {
                    let chunk = buffer.split_to(chunk_size).freeze();
                    if chunk_tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%container, %object, error = %err, "download stream failed");
                let _ = chunk_tx.send(Err(err.into())).await;
                return;
            }
        }
    }
    if !buffer.is_empty() {
        let _ = chunk_tx.send(Ok(buffer.freeze())).await;
    }
    tracing::debug!(%container, %object, "download finished");
}

/// [`Read`] over a download queue, for use off the async runtime.
pub struct BlockingReader {
    chunks: mpsc::Receiver<TransferResult<Bytes>>,
    current: Bytes,
}

impl Read for BlockingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.chunks.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(err)) => return Err(io::Error::other(err)),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}
