//! Cross-account replication of objects and whole containers.
//!
//! Plain objects are stream-copied. Segmented objects have their segments
//! copied into the destination `<container>_segments` container one by one,
//! followed by a rewritten zero-byte manifest. Encrypted objects (`.c4gh`)
//! also get their out-of-band header copied through the key store.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};

use super::download_service::DEFAULT_CONTENT_TYPE;
use super::swift::{ObjectBackend, container_ready, empty_body, list_all};
use super::upload_service::SEGMENTS_SUFFIX;
use super::vault::HeaderStore;
use crate::errors::{TransferError, TransferResult};
use crate::models::account::SwiftAccount;

const MANIFEST_HEADER: &str = "x-object-manifest";
const USERTAGS_HEADER: &str = "x-object-meta-usertags";
const ENCRYPTED_SUFFIX: &str = ".c4gh";
const WHITELIST_FLAVOR: &str = "crypt4gh";

/// Parameters of one replication, as given on the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    pub project: String,
    pub container: String,
    pub source_project: String,
    pub source_container: String,
    /// Copy only this object instead of the whole container.
    pub source_object: Option<String>,
    /// Human-readable project names used by the key store.
    pub project_name: Option<String>,
    pub source_project_name: Option<String>,
}

pub struct ReplicationJob {
    backend: Arc<dyn ObjectBackend>,
    headers: Arc<dyn HeaderStore>,
    dest: SwiftAccount,
    source: SwiftAccount,
    request: ReplicationRequest,
}

fn write_failed(status: StatusCode, container: &str, object: &str) -> TransferError {
    if status == StatusCode::REQUEST_TIMEOUT {
        TransferError::BackendTimeout
    } else {
        TransferError::ObjectWrite {
            container: container.to_string(),
            object: object.to_string(),
            status: status.as_u16(),
        }
    }
}

fn listing_failed(status: StatusCode, container: &str) -> TransferError {
    match status {
        StatusCode::NOT_FOUND => TransferError::SourceNotFound {
            container: container.to_string(),
            object: String::new(),
            status: 404,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransferError::ContainerAccess {
            container: container.to_string(),
            status: status.as_u16(),
        },
        _ => TransferError::Listing {
            container: container.to_string(),
            status: status.as_u16(),
        },
    }
}

impl ReplicationJob {
    /// Both accounts are reached through the session endpoint and token.
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        headers: Arc<dyn HeaderStore>,
        endpoint: &str,
        token: &str,
        request: ReplicationRequest,
    ) -> Self {
        Self {
            dest: SwiftAccount::for_project(endpoint, token, &request.project),
            source: SwiftAccount::for_project(endpoint, token, &request.source_project),
            backend,
            headers,
            request,
        }
    }

    pub fn request(&self) -> &ReplicationRequest {
        &self.request
    }

    /// Copy the requested object, or every object of the source container.
    pub async fn run(&self) -> TransferResult<()> {
        tracing::info!(
            from = %format!("{}/{}", self.request.source_project, self.request.source_container),
            to = %format!("{}/{}", self.request.project, self.request.container),
            object = self.request.source_object.as_deref().unwrap_or("*"),
            "replication started"
        );
        match self.request.source_object.clone() {
            Some(object) => self.copy_single_object(&object).await,
            None => self.copy_container().await,
        }
    }

    pub async fn copy_single_object(&self, object: &str) -> TransferResult<()> {
        self.whitelist_key().await?;
        let copied = self.copy_object(object).await;
        let removed = self.remove_whitelist_key().await;
        copied.and(removed)
    }

    /// Copy objects one at a time, stopping at the first failure.
    pub async fn copy_container(&self) -> TransferResult<()> {
        let source_container = &self.request.source_container;
        let listing = list_all(self.backend.as_ref(), &self.source, source_container, None).await?;
        if !listing.status.is_success() {
            return Err(listing_failed(listing.status, source_container));
        }
        tracing::debug!(
            container = %source_container,
            objects = listing.names.len(),
            "replicating container"
        );

        self.whitelist_key().await?;
        let mut copied = Ok(());
        for object in &listing.names {
            copied = self.copy_object(object).await;
            if copied.is_err() {
                break;
            }
        }
        let removed = self.remove_whitelist_key().await;
        copied.and(removed)
    }

    /// Create `container` at the destination unless it already exists.
    pub async fn ensure_container(&self, container: &str) -> TransferResult<()> {
        if self
            .backend
            .head_container(&self.dest, container)
            .await?
            .is_success()
        {
            return Ok(());
        }
        let status = self.backend.put_container(&self.dest, container).await?;
        if container_ready(status) {
            tracing::debug!(%container, "created replication target");
            Ok(())
        } else {
            Err(TransferError::ContainerCreate {
                container: container.to_string(),
                status: status.as_u16(),
            })
        }
    }

    pub async fn copy_object(&self, object: &str) -> TransferResult<()> {
        let source_container = &self.request.source_container;
        let container = &self.request.container;

        let resp = self
            .backend
            .get_object(&self.source, source_container, object, None)
            .await?;
        if resp.status != StatusCode::OK {
            return Err(TransferError::SourceNotFound {
                container: source_container.clone(),
                object: object.to_string(),
                status: resp.status.as_u16(),
            });
        }
        self.ensure_container(container).await?;

        let mut headers = HeaderMap::new();
        for (name, value) in resp.headers.iter() {
            if name.as_str().starts_with(USERTAGS_HEADER) {
                headers.insert(name.clone(), value.clone());
            }
        }

        match resp.header(MANIFEST_HEADER).map(str::to_string) {
            Some(manifest) => {
                tracing::info!(%object, %manifest, "copying segmented object");
                let new_manifest = self.sync_segments(&manifest).await?;
                let value = HeaderValue::from_bytes(new_manifest.as_bytes())
                    .map_err(|_| TransferError::Protocol(format!("bad manifest `{new_manifest}`")))?;
                headers.insert(HeaderName::from_static(MANIFEST_HEADER), value);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
                let status = self
                    .backend
                    .put_object(&self.dest, container, object, headers, empty_body())
                    .await?;
                if status != StatusCode::CREATED {
                    return Err(TransferError::ManifestWrite {
                        object: object.to_string(),
                        status: status.as_u16(),
                    });
                }
            }
            None => {
                tracing::info!(%object, "copying object in full");
                copy_entity_headers(&resp.headers, &mut headers, source_container, object)?;
                let status = self
                    .backend
                    .put_object(&self.dest, container, object, headers, resp.body)
                    .await?;
                if !matches!(status, StatusCode::CREATED | StatusCode::ACCEPTED) {
                    return Err(write_failed(status, container, object));
                }
            }
        }

        if object.ends_with(ENCRYPTED_SUFFIX) {
            self.copy_header(object).await?;
        }
        tracing::debug!(%object, "object replicated");
        Ok(())
    }

    /// Copy the segments behind `manifest` and return the manifest value
    /// pointing at the destination segments container.
    async fn sync_segments(&self, manifest: &str) -> TransferResult<String> {
        let (source_segments, prefix) = manifest.split_once('/').unwrap_or((manifest, ""));
        let dest_segments = format!("{}{SEGMENTS_SUFFIX}", self.request.container);
        self.ensure_container(&dest_segments).await?;

        let listing = list_all(
            self.backend.as_ref(),
            &self.source,
            source_segments,
            Some(prefix).filter(|p| !p.is_empty()),
        )
        .await?;
        if !listing.status.is_success() {
            return Err(listing_failed(listing.status, source_segments));
        }

        for segment in &listing.names {
            let resp = self
                .backend
                .get_object(&self.source, source_segments, segment, None)
                .await?;
            if !resp.status.is_success() {
                return Err(TransferError::SourceNotFound {
                    container: source_segments.to_string(),
                    object: segment.clone(),
                    status: resp.status.as_u16(),
                });
            }
            let mut headers = HeaderMap::new();
            copy_entity_headers(&resp.headers, &mut headers, source_segments, segment)?;

            let status = self
                .backend
                .put_object(&self.dest, &dest_segments, segment, headers, resp.body)
                .await?;
            tracing::debug!(%segment, status = status.as_u16(), "segment copied");
            if !matches!(status, StatusCode::CREATED | StatusCode::ACCEPTED) {
                return Err(write_failed(status, &dest_segments, segment));
            }
        }

        Ok(format!("{dest_segments}/{prefix}"))
    }

    fn key_store_names(&self) -> (&str, &str) {
        let request = &self.request;
        (
            request.project_name.as_deref().unwrap_or(&request.project),
            request
                .source_project_name
                .as_deref()
                .unwrap_or(&request.source_project),
        )
    }

    /// Copy the encryption header of `object`, if the source has one.
    async fn copy_header(&self, object: &str) -> TransferResult<()> {
        let (project, source_project) = self.key_store_names();
        let header = self
            .headers
            .get_header(
                project,
                &self.request.source_container,
                object,
                Some(source_project),
            )
            .await?;
        let Some(header) = header else {
            tracing::debug!(%object, "no header to copy");
            return Ok(());
        };
        self.headers
            .put_header(project, &self.request.container, object, &header, None)
            .await
    }

    fn whitelisting(&self) -> Option<&str> {
        match (&self.request.project_name, &self.request.source_project_name) {
            (Some(name), Some(_)) => Some(name),
            _ => None,
        }
    }

    /// Allow re-encryption for the destination project during the copy.
    async fn whitelist_key(&self) -> TransferResult<()> {
        let Some(project) = self.whitelisting() else {
            return Ok(());
        };
        let encoded = self.headers.get_public_key(project).await?;
        let key = URL_SAFE
            .decode(encoded.trim())
            .or_else(|_| STANDARD.decode(encoded.trim()))
            .map_err(|err| TransferError::KeyManagement {
                status: 502,
                message: format!("public key of `{project}` is not base64: {err}"),
            })?;
        tracing::debug!(%project, "whitelisting project key for re-encryption");
        self.headers
            .put_whitelist_key(project, WHITELIST_FLAVOR, &key)
            .await
    }

    async fn remove_whitelist_key(&self) -> TransferResult<()> {
        match self.whitelisting() {
            Some(project) => self.headers.remove_whitelist_key(project).await,
            None => Ok(()),
        }
    }
}

/// Copy length, type and entity tag of a source read into a write request.
fn copy_entity_headers(
    from: &HeaderMap,
    to: &mut HeaderMap,
    container: &str,
    object: &str,
) -> TransferResult<()> {
    let etag = from
        .get(header::ETAG)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TransferError::MissingEtag {
            container: container.to_string(),
            object: object.to_string(),
        })?;
    to.insert(header::ETAG, etag.clone());
    if let Some(length) = from.get(header::CONTENT_LENGTH) {
        to.insert(header::CONTENT_LENGTH, length.clone());
    }
    to.insert(
        header::CONTENT_TYPE,
        from.get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    Ok(())
}
