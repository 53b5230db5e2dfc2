//! TransferService: the shared state handed to every HTTP handler.
//!
//! It owns the storage and key-management clients, the identity exchange
//! and the session registry, and starts the long-running transfer tasks.

use std::sync::Arc;

use super::archive_service::ArchiveProxy;
use super::download_service::{DownloadProxy, DownloadRequest};
use super::keystone::{ScopedToken, TokenExchange};
use super::replication_service::{ReplicationJob, ReplicationRequest};
use super::session::{SessionRegistry, UploadSession};
use super::swift::ObjectBackend;
use super::vault::HeaderStore;
use crate::config::TransferLimits;
use crate::errors::{TransferError, TransferResult};

#[derive(Clone)]
pub struct TransferService {
    pub backend: Arc<dyn ObjectBackend>,
    pub headers: Arc<dyn HeaderStore>,
    pub exchange: Arc<dyn TokenExchange>,
    pub sessions: Arc<SessionRegistry>,
    pub limits: TransferLimits,
    /// Shared secrets accepted for request signatures.
    pub api_tokens: Arc<Vec<String>>,
    pub disable_auth: bool,
}

impl TransferService {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        headers: Arc<dyn HeaderStore>,
        exchange: Arc<dyn TokenExchange>,
        limits: TransferLimits,
        api_tokens: Vec<String>,
        disable_auth: bool,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            backend.clone(),
            headers.clone(),
            limits,
        ));
        Self {
            backend,
            headers,
            exchange,
            sessions,
            limits,
            api_tokens: Arc::new(api_tokens),
            disable_auth,
        }
    }

    /// Rescope `token` to `project` and open a session for it.
    pub async fn login(&self, project: &str, token: &str) -> TransferResult<Arc<UploadSession>> {
        let ScopedToken { token, endpoint } = self.exchange.rescope(token, project).await?;
        let session = self.sessions.create(project, &endpoint, &token);
        tracing::info!(%project, sessions = self.sessions.len(), "opened upload runner session");
        Ok(session)
    }

    /// Drop the session and cancel whatever it was still uploading.
    pub async fn logout(&self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            session.close_uploads().await;
            tracing::info!(project = %session.project, "closed upload runner session");
        }
    }

    pub fn session(&self, session_id: Option<&str>) -> TransferResult<Arc<UploadSession>> {
        let id = session_id
            .ok_or_else(|| TransferError::Unauthorized("Missing runner session ID".into()))?;
        self.sessions
            .get(id)
            .ok_or_else(|| TransferError::Unauthorized("Unknown runner session ID".into()))
    }

    pub fn download(
        &self,
        session: &UploadSession,
        project: &str,
        container: &str,
        object: &str,
        range: Option<String>,
    ) -> DownloadProxy {
        DownloadProxy::begin(
            self.backend.clone(),
            DownloadRequest {
                account: session.account(project),
                container: container.to_string(),
                object: object.to_string(),
                range,
                chunk_size: self.limits.download_chunk,
                queue_depth: self.limits.proxy_queue,
            },
        )
    }

    pub async fn archive(
        &self,
        session: &UploadSession,
        project: &str,
        container: &str,
    ) -> TransferResult<ArchiveProxy> {
        ArchiveProxy::begin(
            self.backend.clone(),
            session.account(project),
            container.to_string(),
            self.limits,
        )
        .await
    }

    /// Run a replication in the background; its outcome is only logged.
    pub fn replicate(&self, session: &UploadSession, request: ReplicationRequest) {
        let job = ReplicationJob::new(
            self.backend.clone(),
            self.headers.clone(),
            session.endpoint(),
            session.token(),
            request,
        );
        tokio::spawn(async move {
            match job.run().await {
                Ok(()) => tracing::info!(target_container = %job.request().container, "replication finished"),
                Err(err) if err.is_client_error() => tracing::warn!(
                    target_container = %job.request().container,
                    error = %err,
                    "replication rejected"
                ),
                Err(err) => tracing::error!(
                    target_container = %job.request().container,
                    error = %err,
                    "replication failed"
                ),
            }
        });
    }
}
