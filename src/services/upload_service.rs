//! Segmented upload of one object.
//!
//! An [`UploadJob`] receives chunks in any order, feeds them per segment in
//! ascending order into streamed segment writes, and commits the object with
//! a zero-byte dynamic large object manifest once every chunk is in.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::chunk_cache::{ChunkCache, Insert, Wait};
use super::swift::{ObjectBackend, container_ready, empty_body};
use super::vault::HeaderStore;
use crate::config::TransferLimits;
use crate::errors::{TransferError, TransferResult};
use crate::models::account::SwiftAccount;
use crate::models::messages::ServerEvent;
use crate::models::upload::{SegmentPlan, manifest_prefix, segment_object_name};

/// Suffix of the container holding an upload's segments.
pub const SEGMENTS_SUFFIX: &str = "_segments";

const SEGMENT_CONTENT_TYPE: &str = "application/swiftclient-segment";
const SEGMENT_QUEUE: usize = 16;

/// Outbound control-channel events.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    AwaitingHeader,
    Uploading,
    AwaitingSegments,
    Finalizing,
    Done,
    Failed,
}

impl JobState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// What is being uploaded and on whose behalf.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub container: String,
    pub object: String,
    /// Key-management namespace for the header.
    pub name: String,
    pub owner_name: Option<String>,
    pub total: u64,
}

pub struct UploadJob {
    backend: Arc<dyn ObjectBackend>,
    headers: Arc<dyn HeaderStore>,
    account: SwiftAccount,
    target: UploadTarget,
    plan: SegmentPlan,
    segment_id: String,
    cache: ChunkCache,
    events: EventSender,
    limits: TransferLimits,
    state: Mutex<JobState>,
    feeders: Mutex<Vec<JoinHandle<()>>>,
    finishing: AtomicBool,
    cancel: CancellationToken,
}

impl UploadJob {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        headers: Arc<dyn HeaderStore>,
        account: SwiftAccount,
        target: UploadTarget,
        events: EventSender,
        limits: TransferLimits,
    ) -> Arc<Self> {
        let plan = SegmentPlan::new(target.total, limits.segment_size, limits.chunk_size);
        tracing::debug!(
            container = %target.container,
            object = %target.object,
            total = plan.total_size,
            segments = plan.total_segments,
            chunks = plan.total_chunks,
            last_segment_chunks = plan.final_segment_chunks(),
            "new upload"
        );
        Arc::new(Self {
            backend,
            headers,
            account,
            target,
            plan,
            segment_id: uuid::Uuid::new_v4().simple().to_string(),
            cache: ChunkCache::new(),
            events,
            limits,
            state: Mutex::new(JobState::AwaitingHeader),
            feeders: Mutex::new(Vec::new()),
            finishing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` unless the job already ended. Returns whether it moved.
    fn set_state(&self, next: JobState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return false;
        }
        tracing::debug!(object = %self.target.object, from = ?*state, to = ?next, "upload state");
        *state = next;
        true
    }

    fn segments_container(&self) -> String {
        format!("{}{}", self.target.container, SEGMENTS_SUFFIX)
    }

    fn emit(&self, make: impl FnOnce(String, String) -> ServerEvent) {
        let event = make(self.target.container.clone(), self.target.object.clone());
        // A closed channel means the client is gone; cancellation follows.
        let _ = self.events.send(event);
    }

    /// Mark the job failed and report `reason` once.
    fn fail(&self, reason: String) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_terminal() {
                return;
            }
            *state = JobState::Failed;
        }
        tracing::warn!(object = %self.target.object, %reason, "upload failed");
        self.emit(|container, object| ServerEvent::Abort {
            container,
            object,
            reason,
        });
    }

    /// Prepare containers, store the header and start one feeder per segment.
    pub async fn begin(self: &Arc<Self>, header: Option<&[u8]>) -> TransferResult<()> {
        if let Err(err) = self.ensure_containers().await {
            tracing::warn!(error = %err, "container setup failed");
            self.fail("Could not create or access the container.".into());
            return Err(err);
        }

        if let Some(header) = header {
            let encoded = STANDARD.encode(header);
            let stored = self
                .headers
                .put_header(
                    &self.target.name,
                    &self.target.container,
                    &self.target.object,
                    &encoded,
                    self.target.owner_name.as_deref(),
                )
                .await;
            if let Err(err) = stored {
                self.fail(err.to_string());
                return Err(err);
            }
        }
        self.set_state(JobState::Uploading);

        let handles = (0..self.plan.total_segments)
            .map(|segment| tokio::spawn(self.clone().feed(segment)))
            .collect();
        *self.feeders.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        self.set_state(JobState::AwaitingSegments);

        self.emit(|container, object| ServerEvent::StartUpload { container, object });
        if self.plan.total_segments == 0 {
            self.emit(|container, object| ServerEvent::Success { container, object });
        }
        Ok(())
    }

    async fn ensure_containers(&self) -> TransferResult<()> {
        for container in [self.target.container.clone(), self.segments_container()] {
            let status = self.backend.head_container(&self.account, &container).await?;
            if status.is_success() {
                continue;
            }
            let created = self.backend.put_container(&self.account, &container).await?;
            if !container_ready(created) {
                return Err(TransferError::ContainerCreate {
                    container,
                    status: created.as_u16(),
                });
            }
        }
        Ok(())
    }

    /// Accept chunk `index`. `acknowledge` asks for a `next` once consumed.
    pub fn add_chunk(&self, index: u64, data: Bytes, acknowledge: bool) -> Insert {
        if index >= self.plan.total_chunks {
            tracing::debug!(index, total = self.plan.total_chunks, "chunk out of range");
            return Insert::Duplicate;
        }
        self.cache.insert(index, data, acknowledge)
    }

    /// Wait until the cache has room for another batch.
    pub async fn wait_for_capacity(&self) -> bool {
        self.cache.wait_capacity(self.limits.cache_depth).await
    }

    async fn feed(self: Arc<Self>, segment: u64) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.upload_segment(segment) => result,
        };
        match result {
            Ok(()) if self.plan.is_last_segment(segment) => {
                tracing::info!(object = %self.target.object, "last segment written");
                self.emit(|container, object| ServerEvent::Success { container, object });
            }
            Ok(()) => {}
            Err(TransferError::Cancelled) => {}
            Err(err) => self.fail(err.to_string()),
        }
    }

    async fn upload_segment(&self, segment: u64) -> TransferResult<()> {
        let range = self.plan.chunk_range(segment);
        loop {
            match self.cache.wait(range.start, self.limits.chunk_timeout).await {
                Wait::Ready => break,
                Wait::TimedOut => continue,
                Wait::Closed => return Err(TransferError::Cancelled),
            }
        }
        tracing::debug!(segment, "first chunk available, starting segment write");

        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(SEGMENT_QUEUE);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(SEGMENT_CONTENT_TYPE),
        );
        let name = segment_object_name(&self.target.object, &self.segment_id, segment);
        let segments_container = self.segments_container();

        let put = self.backend.put_object(
            &self.account,
            &segments_container,
            &name,
            headers,
            ReceiverStream::new(rx).boxed(),
        );
        let push = self.push_chunks(range, tx);
        tokio::pin!(put);
        tokio::pin!(push);

        let status = tokio::select! {
            status = &mut put => {
                tracing::warn!(segment, "segment write ended before its last chunk");
                status?
            }
            pushed = &mut push => {
                pushed?;
                put.await?
            }
        };

        tracing::info!(segment, status = status.as_u16(), "segment finished");
        if !status.is_success() {
            return Err(TransferError::SegmentWrite {
                segment,
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Move the chunks of one segment, in order, into its write stream.
    /// Dropping `tx` at the end closes the stream.
    async fn push_chunks(
        &self,
        range: std::ops::Range<u64>,
        tx: mpsc::Sender<io::Result<Bytes>>,
    ) -> TransferResult<()> {
        for index in range {
            loop {
                match self.cache.wait(index, self.limits.chunk_timeout).await {
                    Wait::Ready => break,
                    Wait::Closed => return Err(TransferError::Cancelled),
                    Wait::TimedOut => {
                        tracing::debug!(index, "chunk overdue, asking again");
                        self.emit(|container, object| ServerEvent::RetryChunk {
                            container,
                            object,
                            order: index,
                        });
                    }
                }
            }

            let taken = self.cache.take(index).ok_or(TransferError::Cancelled)?;
            if tx.send(Ok(taken.data)).await.is_err() {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "segment stream closed",
                )));
            }
            if taken.acknowledge {
                self.emit(|container, object| ServerEvent::Next { container, object });
            }
        }
        Ok(())
    }

    /// Mark the job as finishing. Only the first caller gets `true`.
    pub fn claim_finish(&self) -> bool {
        !self.finishing.swap(true, Ordering::SeqCst)
    }

    /// Wait for every feeder, then commit the manifest.
    ///
    /// Chunks the client never sent fail the job at once; waiting for them
    /// would keep the feeders asking for chunks that will not come.
    pub async fn finish(&self) -> TransferResult<()> {
        let missing = self.cache.missing_count(self.plan.total_chunks);
        if missing > 0 {
            let err = TransferError::IncompleteUpload {
                done: self.plan.total_chunks - missing,
                total: self.plan.total_chunks,
            };
            self.fail(err.to_string());
            self.cancel().await;
            return Err(err);
        }

        let handles = std::mem::take(&mut *self.feeders.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "segment feeder ended abnormally");
            }
        }
        if self.state() == JobState::Failed {
            return Err(TransferError::JobFailed(self.target.object.clone()));
        }
        self.commit_manifest().await
    }

    /// Write the manifest if, and only if, every chunk has been consumed.
    pub async fn commit_manifest(&self) -> TransferResult<()> {
        if !self.cache.is_complete(self.plan.total_chunks) {
            let err = TransferError::IncompleteUpload {
                done: self.cache.completed_count(),
                total: self.plan.total_chunks,
            };
            self.fail(err.to_string());
            return Err(err);
        }
        self.set_state(JobState::Finalizing);

        let prefix = manifest_prefix(
            &self.segments_container(),
            &self.target.object,
            &self.segment_id,
        );
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        headers.insert(
            HeaderName::from_static("x-object-manifest"),
            HeaderValue::from_bytes(prefix.as_bytes())
                .map_err(|_| TransferError::Protocol(format!("invalid object name `{prefix}`")))?,
        );

        tracing::info!(object = %self.target.object, manifest = %prefix, "adding manifest");
        let status = self
            .backend
            .put_object(
                &self.account,
                &self.target.container,
                &self.target.object,
                headers,
                empty_body(),
            )
            .await;
        let status = match status {
            Ok(status) if status.is_success() => status,
            Ok(status) => {
                let err = TransferError::ManifestWrite {
                    object: self.target.object.clone(),
                    status: status.as_u16(),
                };
                self.fail(err.to_string());
                return Err(err);
            }
            Err(err) => {
                self.fail(err.to_string());
                return Err(err.into());
            }
        };

        tracing::debug!(status = status.as_u16(), "manifest written");
        if !self.set_state(JobState::Done) {
            // Cancelled while the manifest was in flight.
            return Err(TransferError::Cancelled);
        }
        self.emit(|container, object| ServerEvent::Done { container, object });
        Ok(())
    }

    /// Stop every feeder and delete whatever this job could have written.
    pub async fn cancel(&self) {
        let finalizing = self.state() == JobState::Finalizing;
        self.cancel.cancel();
        self.cache.close();
        let handles = std::mem::take(&mut *self.feeders.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in &handles {
            handle.abort();
        }
        self.fail("cancel".into());

        let segments_container = self.segments_container();
        let names: Vec<String> = (0..self.plan.total_segments)
            .map(|segment| segment_object_name(&self.target.object, &self.segment_id, segment))
            .collect();
        let deletes = names
            .iter()
            .map(|name| self.backend.delete_object(&self.account, &segments_container, name));
        let statuses: Vec<String> = futures::future::join_all(deletes)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(status) => status.as_u16().to_string(),
                Err(err) => err.to_string(),
            })
            .collect();
        tracing::info!(object = %self.target.object, ?statuses, "segment deletions finished");

        if finalizing {
            let _ = self
                .backend
                .delete_object(&self.account, &self.target.container, &self.target.object)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_backend::MemoryBackend;
    use crate::services::vault::MemoryHeaderStore;
    use axum::http::StatusCode;
    use rand::seq::SliceRandom;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    fn limits() -> TransferLimits {
        TransferLimits {
            segment_size: 5 * MIB,
            chunk_size: 64 * KIB,
            cache_depth: 8,
            chunk_timeout: Duration::from_millis(200),
            ..TransferLimits::default()
        }
    }

    fn account() -> SwiftAccount {
        SwiftAccount {
            host: "http://mem/v1/AUTH_proj".into(),
            token: "tok".into(),
        }
    }

    struct Fixture {
        backend: Arc<MemoryBackend>,
        headers: Arc<MemoryHeaderStore>,
        job: Arc<UploadJob>,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    }

    fn fixture(total: u64) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let headers = Arc::new(MemoryHeaderStore::default());
        let (tx, events) = mpsc::unbounded_channel();
        let job = UploadJob::new(
            backend.clone(),
            headers.clone(),
            account(),
            UploadTarget {
                container: "box".into(),
                object: "dir/big.c4gh".into(),
                name: "proj-name".into(),
                owner_name: None,
                total,
            },
            tx,
            limits(),
        );
        Fixture {
            backend,
            headers,
            job,
            events,
        }
    }

    fn payload(total: u64) -> Vec<u8> {
        (0..total).map(|i| (i % 251) as u8).collect()
    }

    fn chunk(data: &[u8], index: u64, size: u64) -> Bytes {
        let start = (index * size) as usize;
        let end = (start + size as usize).min(data.len());
        Bytes::copy_from_slice(&data[start..end])
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn shuffled_upload_round_trips_in_three_segments() {
        let total = 12 * MIB;
        let mut fx = fixture(total);
        let data = payload(total);
        fx.job.begin(Some(b"crypt4gh-header")).await.unwrap();

        let mut order: Vec<u64> = (0..fx.job.plan.total_chunks).collect();
        order.shuffle(&mut rand::thread_rng());
        for (n, index) in order.iter().enumerate() {
            fx.job.add_chunk(*index, chunk(&data, *index, 64 * KIB), false);
            if n % 7 == 0 {
                fx.job.add_chunk(*index, chunk(&data, *index, 64 * KIB), false);
            }
        }

        fx.job.finish().await.unwrap();
        assert_eq!(fx.job.state(), JobState::Done);

        let acc = account();
        let segments = fx.backend.object_names(&acc, "box_segments");
        assert_eq!(segments.len(), 3);
        let sizes: Vec<usize> = segments
            .iter()
            .map(|name| fx.backend.object(&acc, "box_segments", name).unwrap().data.len())
            .collect();
        assert_eq!(sizes, vec![5 * MIB as usize, 5 * MIB as usize, 2 * MIB as usize]);
        assert!(segments[0].ends_with("/00000001"));

        let manifest = fx.backend.object(&acc, "box", "dir/big.c4gh").unwrap();
        assert!(manifest.data.is_empty());
        let prefix = manifest.manifest().unwrap().to_string();
        assert!(prefix.starts_with("box_segments/dir/big.c4gh/"));
        assert!(segments.iter().all(|s| format!("box_segments/{s}").starts_with(&prefix)));

        assert_eq!(fx.backend.read(&acc, "box", "dir/big.c4gh").unwrap(), data);

        let segment_puts = fx
            .backend
            .requests()
            .iter()
            .filter(|r| r.method == "PUT" && r.container == "box_segments" && r.object.is_some())
            .count();
        assert_eq!(segment_puts, 3);

        assert_eq!(
            fx.headers.header("proj-name", "box", "dir/big.c4gh").as_deref(),
            Some(STANDARD.encode(b"crypt4gh-header").as_str())
        );

        let events = drain(&mut fx.events);
        assert!(matches!(events.first(), Some(ServerEvent::StartUpload { .. })));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Success { .. })));
        assert!(matches!(events.last(), Some(ServerEvent::Done { .. })));
    }

    #[tokio::test]
    async fn acknowledged_chunks_request_next() {
        let total = 3 * 64 * KIB;
        let mut fx = fixture(total);
        let data = payload(total);
        fx.job.begin(None).await.unwrap();
        for index in 0..3 {
            fx.job.add_chunk(index, chunk(&data, index, 64 * KIB), true);
        }
        fx.job.finish().await.unwrap();

        let nexts = drain(&mut fx.events)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Next { .. }))
            .count();
        assert_eq!(nexts, 3);
        assert!(fx.headers.calls().is_empty());
    }

    #[tokio::test]
    async fn manifest_requires_every_chunk() {
        let total = 12 * MIB;
        let mut fx = fixture(total);
        let data = payload(total);
        fx.job.begin(None).await.unwrap();

        let last = fx.job.plan.total_chunks - 1;
        for index in 0..last {
            fx.job.add_chunk(index, chunk(&data, index, 64 * KIB), false);
        }
        // Let the first two segments finish.
        for _ in 0..100 {
            if fx.backend.object_names(&account(), "box_segments").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = fx.job.commit_manifest().await.unwrap_err();
        assert!(matches!(err, TransferError::IncompleteUpload { total: 192, .. }));
        assert!(fx.backend.object(&account(), "box", "dir/big.c4gh").is_none());

        fx.job.cancel().await;
        assert!(fx.backend.object_names(&account(), "box_segments").is_empty());
        let events = drain(&mut fx.events);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Abort { .. })));
    }

    #[tokio::test]
    async fn overdue_chunk_is_requested_again() {
        let total = 2 * 64 * KIB;
        let mut fx = fixture(total);
        let data = payload(total);
        fx.job.begin(None).await.unwrap();
        fx.job.add_chunk(0, chunk(&data, 0, 64 * KIB), false);

        let retry = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match fx.events.recv().await {
                    Some(ServerEvent::RetryChunk { order, .. }) => return order,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(retry, 1);

        fx.job.add_chunk(1, chunk(&data, 1, 64 * KIB), false);
        fx.job.finish().await.unwrap();
        assert_eq!(fx.backend.read(&account(), "box", "dir/big.c4gh").unwrap(), data);
    }

    #[tokio::test]
    async fn failed_segment_write_aborts_the_job() {
        let total = 64 * KIB;
        let mut fx = fixture(total);
        fx.backend.fail_puts_under("dir/big.c4gh/");
        fx.job.begin(None).await.unwrap();
        fx.job.add_chunk(0, Bytes::from(payload(total)), false);

        let err = fx.job.finish().await.unwrap_err();
        assert!(matches!(err, TransferError::JobFailed(_)));
        assert_eq!(fx.job.state(), JobState::Failed);
        let aborts: Vec<_> = drain(&mut fx.events)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Abort { .. }))
            .collect();
        assert_eq!(aborts.len(), 1);
        assert!(fx.backend.object(&account(), "box", "dir/big.c4gh").is_none());
    }

    fn aborts(events: &[ServerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Abort { .. }))
            .count()
    }

    #[tokio::test]
    async fn rejected_container_fails_before_upload_starts() {
        let mut fx = fixture(64 * KIB);
        fx.backend.answer_container_puts(StatusCode::FORBIDDEN);

        let err = fx.job.begin(Some(b"hdr")).await.unwrap_err();
        assert!(matches!(err, TransferError::ContainerCreate { status: 403, .. }));
        assert_eq!(fx.job.state(), JobState::Failed);
        assert!(fx.headers.calls().is_empty());

        let events = drain(&mut fx.events);
        assert_eq!(events.len(), 1);
        assert_eq!(aborts(&events), 1);
    }

    #[tokio::test]
    async fn existing_container_conflict_is_not_an_error() {
        let total = 64 * KIB;
        let fx = fixture(total);
        fx.backend.answer_container_puts(StatusCode::CONFLICT);

        fx.job.begin(None).await.unwrap();
        fx.job.add_chunk(0, Bytes::from(payload(total)), false);
        fx.job.finish().await.unwrap();

        assert_eq!(fx.job.state(), JobState::Done);
        assert_eq!(
            fx.backend.read(&account(), "box", "dir/big.c4gh").unwrap(),
            payload(total)
        );
    }

    #[tokio::test]
    async fn header_store_failure_fails_the_job() {
        let mut fx = fixture(64 * KIB);
        fx.headers.fail_puts();

        let err = fx.job.begin(Some(b"hdr")).await.unwrap_err();
        assert!(matches!(err, TransferError::KeyManagement { status: 503, .. }));
        assert_eq!(fx.job.state(), JobState::Failed);

        let events = drain(&mut fx.events);
        assert_eq!(aborts(&events), 1);
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::StartUpload { .. })));
    }

    #[tokio::test]
    async fn rejected_manifest_fails_the_job_once() {
        let total = 64 * KIB;
        let mut fx = fixture(total);
        fx.backend.answer_manifest_puts(StatusCode::SERVICE_UNAVAILABLE);

        fx.job.begin(None).await.unwrap();
        fx.job.add_chunk(0, Bytes::from(payload(total)), false);
        let err = fx.job.finish().await.unwrap_err();
        assert!(matches!(err, TransferError::ManifestWrite { status: 503, .. }));
        assert_eq!(fx.job.state(), JobState::Failed);

        let events = drain(&mut fx.events);
        assert_eq!(aborts(&events), 1);
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Done { .. })));
        assert!(fx.backend.object(&account(), "box", "dir/big.c4gh").is_none());
        // Written segments stay behind.
        assert_eq!(fx.backend.object_names(&account(), "box_segments").len(), 1);
    }

    #[tokio::test]
    async fn finish_with_undelivered_chunks_stops_the_feeders() {
        let total = 2 * 64 * KIB;
        let mut fx = fixture(total);
        let data = payload(total);
        fx.job.begin(None).await.unwrap();
        fx.job.add_chunk(0, chunk(&data, 0, 64 * KIB), false);

        let err = fx.job.finish().await.unwrap_err();
        assert!(matches!(err, TransferError::IncompleteUpload { done: 1, total: 2 }));
        assert_eq!(fx.job.state(), JobState::Failed);

        // Longer than the chunk timeout: a live feeder would ask for chunk 1.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let events = drain(&mut fx.events);
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::RetryChunk { .. })));
        assert_eq!(aborts(&events), 1);
        assert!(fx.backend.object_names(&account(), "box_segments").is_empty());
    }
}
