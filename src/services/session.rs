//! Upload sessions and the registry that owns them.
//!
//! A session binds a scoped storage token to one project and routes control
//! channel commands to the upload jobs it owns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use rand::Rng;

use super::chunk_cache::Insert;
use super::swift::ObjectBackend;
use super::upload_service::{EventSender, JobState, UploadJob, UploadTarget};
use super::vault::HeaderStore;
use crate::config::TransferLimits;
use crate::errors::TransferError;
use crate::models::account::SwiftAccount;
use crate::models::messages::{ClientCommand, ServerEvent};

/// Session id length in random bytes.
const SESSION_ID_BYTES: usize = 32;

/// URL-safe session id from a CSPRNG.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

type JobMap = HashMap<String, HashMap<String, Arc<UploadJob>>>;

pub struct UploadSession {
    pub id: String,
    pub project: String,
    endpoint: String,
    token: String,
    backend: Arc<dyn ObjectBackend>,
    headers: Arc<dyn HeaderStore>,
    limits: TransferLimits,
    jobs: Arc<Mutex<JobMap>>,
}

fn lock_jobs(jobs: &Mutex<JobMap>) -> std::sync::MutexGuard<'_, JobMap> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remove `container/object` from `jobs` if it still maps to `job`.
fn forget_job(jobs: &Mutex<JobMap>, container: &str, object: &str, job: &Arc<UploadJob>) {
    let mut jobs = lock_jobs(jobs);
    let Some(objects) = jobs.get_mut(container) else {
        return;
    };
    if objects.get(object).is_some_and(|current| Arc::ptr_eq(current, job)) {
        objects.remove(object);
    }
    if objects.is_empty() {
        jobs.remove(container);
    }
}

fn abort(events: &EventSender, container: &str, object: &str, reason: &str) {
    let _ = events.send(ServerEvent::Abort {
        container: container.to_string(),
        object: object.to_string(),
        reason: reason.to_string(),
    });
}

fn next(events: &EventSender, container: &str, object: &str) {
    let _ = events.send(ServerEvent::Next {
        container: container.to_string(),
        object: object.to_string(),
    });
}

impl UploadSession {
    /// Account used for requests against `project`.
    pub fn account(&self, project: &str) -> SwiftAccount {
        SwiftAccount::for_project(&self.endpoint, &self.token, project)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, JobMap> {
        lock_jobs(&self.jobs)
    }

    fn job(&self, container: &str, object: &str) -> Option<Arc<UploadJob>> {
        self.jobs()
            .get(container)
            .and_then(|objects| objects.get(object))
            .cloned()
    }

    fn take_job(&self, container: &str, object: &str) -> Option<Arc<UploadJob>> {
        let mut jobs = self.jobs();
        let job = jobs.get_mut(container)?.remove(object);
        if jobs.get(container).is_some_and(HashMap::is_empty) {
            jobs.remove(container);
        }
        job
    }

    #[cfg(test)]
    pub fn active_uploads(&self) -> usize {
        self.jobs().values().map(HashMap::len).sum()
    }

    /// Handle one control-channel command.
    pub async fn dispatch(&self, command: ClientCommand, events: &EventSender) {
        match command {
            ClientCommand::AddHeader {
                container,
                object,
                name,
                total,
                data,
                owner,
                owner_name,
            } => {
                let (job, stale) = {
                    let mut jobs = self.jobs();
                    let objects = jobs.entry(container.clone()).or_default();
                    // A failed upload may be restarted with a new header.
                    let stale = match objects.get(&object).map(|job| job.state()) {
                        Some(JobState::Failed) => objects.remove(&object),
                        Some(_) => {
                            drop(jobs);
                            let reason = TransferError::AlreadyUploading.to_string();
                            abort(events, &container, &object, &reason);
                            return;
                        }
                        None => None,
                    };

                    let project = owner
                        .filter(|owner| !owner.is_empty())
                        .unwrap_or_else(|| self.project.clone());
                    let target = UploadTarget {
                        container: container.clone(),
                        object: object.clone(),
                        name: if name.is_empty() { self.project.clone() } else { name },
                        owner_name: owner_name.filter(|o| !o.is_empty()),
                        total,
                    };
                    let job = UploadJob::new(
                        self.backend.clone(),
                        self.headers.clone(),
                        self.account(&project),
                        target,
                        events.clone(),
                        self.limits,
                    );
                    objects.insert(object.clone(), job.clone());
                    (job, stale)
                };

                if let Some(stale) = stale {
                    tracing::debug!(%container, %object, "replacing failed upload");
                    stale.cancel().await;
                }
                if job.begin(data.as_deref().map(|d| d.as_slice())).await.is_err() {
                    self.take_job(&container, &object);
                }
            }
            ClientCommand::AddChunk {
                container,
                object,
                order,
                data,
            } => {
                let Some(job) = self.job(&container, &object) else {
                    abort(events, &container, &object, "No active upload for object.");
                    return;
                };
                if job.add_chunk(order, Bytes::from(data.into_vec()), true) == Insert::Duplicate {
                    next(events, &container, &object);
                }
            }
            ClientCommand::AddChunks {
                container,
                object,
                chunks,
            } => {
                let Some(job) = self.job(&container, &object) else {
                    abort(events, &container, &object, "No active upload for object.");
                    return;
                };
                for chunk in chunks {
                    job.add_chunk(chunk.order, Bytes::from(chunk.data.into_vec()), false);
                }
                // Waiting inline would stall the reader behind a chunk that
                // only a later frame can deliver.
                let events = events.clone();
                tokio::spawn(async move {
                    if job.wait_for_capacity().await {
                        next(&events, &container, &object);
                    }
                });
            }
            ClientCommand::Finish { container, object } => {
                let Some(job) = self.job(&container, &object) else {
                    abort(events, &container, &object, "No active upload for object.");
                    return;
                };
                if !job.claim_finish() {
                    tracing::debug!(%container, %object, "finish already requested");
                    return;
                }
                // The job stays in the map until it resolves, so a cancel or a
                // closing channel can still reach it.
                let jobs = self.jobs.clone();
                tokio::spawn(async move {
                    if let Err(err) = job.finish().await {
                        tracing::warn!(%container, %object, error = %err, "upload not committed");
                    }
                    forget_job(&jobs, &container, &object, &job);
                });
            }
            ClientCommand::Cancel { container, object } => {
                match self.take_job(&container, &object) {
                    Some(job) => job.cancel().await,
                    None => abort(events, &container, &object, "cancel"),
                }
            }
        }
    }

    /// Cancel every unfinished upload of this session.
    pub async fn close_uploads(&self) {
        let jobs: Vec<Arc<UploadJob>> = std::mem::take(&mut *self.jobs())
            .into_values()
            .flat_map(HashMap::into_values)
            .collect();
        if !jobs.is_empty() {
            tracing::info!(session_project = %self.project, count = jobs.len(), "cancelling open uploads");
        }
        futures::future::join_all(jobs.iter().map(|job| job.cancel())).await;
    }
}

/// Process-wide owner of the live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<UploadSession>>>,
    backend: Arc<dyn ObjectBackend>,
    headers: Arc<dyn HeaderStore>,
    limits: TransferLimits,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        headers: Arc<dyn HeaderStore>,
        limits: TransferLimits,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            backend,
            headers,
            limits,
        }
    }

    pub fn create(&self, project: &str, endpoint: &str, token: &str) -> Arc<UploadSession> {
        let session = Arc::new(UploadSession {
            id: generate_session_id(),
            project: project.to_string(),
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            backend: self.backend.clone(),
            headers: self.headers.clone(),
            limits: self.limits,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        });
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id.clone(), session.clone());
        tracing::debug!(project, "session opened");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
