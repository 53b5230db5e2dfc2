//! HTTP handlers for downloads, archives, replication and header lookups.
//! Object bodies are streamed from the download queues and never buffered
//! whole in memory.

use crate::{
    errors::AppError,
    services::{
        download_service::ObjectMeta, replication_service::ReplicationRequest,
        transfer_service::TransferService,
    },
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::{SessionQuery, session_id};

const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";

/// Query of `POST /{project}/{container}`.
#[derive(Debug, Deserialize)]
pub struct ReplicateQuery {
    pub from_project: Option<String>,
    pub from_container: Option<String>,
    pub from_object: Option<String>,
    pub project_name: Option<String>,
    pub from_project_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeaderQuery {
    pub owner: Option<String>,
}

/// Download an object `/{project}/{container}/{*object}` as a streaming response.
pub async fn get_object(
    State(service): State<TransferService>,
    Path((project, container, object)): Path<(String, String, String)>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session = service.session(session_id(&headers, &query).as_deref())?;
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut proxy = service.download(&session, &project, &container, &object, range);
    let meta = proxy.metadata().await?;
    tracing::debug!(%project, %container, %object, status = %meta.status, "serving object");

    let mut response = Response::new(Body::from_stream(proxy.into_body()));
    *response.status_mut() = meta.status;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// Download a whole container `/{project}/{container}` as a tar archive.
pub async fn get_container(
    State(service): State<TransferService>,
    Path((project, container)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session = service.session(session_id(&headers, &query).as_deref())?;
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{project}-{container}.tar\""
    ))
    .map_err(|_| AppError::bad_request("container name not usable as a file name"))?;

    let proxy = service.archive(&session, &project, &container).await?;

    let mut response = Response::new(Body::from_stream(proxy.into_body()));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(ARCHIVE_CONTENT_TYPE),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// POST `/{project}/{container}?from_project=&from_container=`: start a replication.
pub async fn replicate(
    State(service): State<TransferService>,
    Path((project, container)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
    Query(params): Query<ReplicateQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session = service.session(session_id(&headers, &query).as_deref())?;
    let (Some(source_project), Some(source_container)) =
        (params.from_project, params.from_container)
    else {
        return Err(AppError::bad_request(
            "from_project and from_container are required",
        ));
    };

    service.replicate(
        &session,
        ReplicationRequest {
            project,
            container,
            source_project,
            source_container,
            source_object: params.from_object,
            project_name: params.project_name.filter(|name| !name.is_empty()),
            source_project_name: params.from_project_name.filter(|name| !name.is_empty()),
        },
    );
    Ok(StatusCode::ACCEPTED.into_response())
}

/// GET `/header/{project}/{container}/{*object}`: stored encryption header.
pub async fn get_header(
    State(service): State<TransferService>,
    Path((project, container, object)): Path<(String, String, String)>,
    Query(query): Query<HeaderQuery>,
) -> Result<Response, AppError> {
    let header = service
        .headers
        .get_header(&project, &container, &object, query.owner.as_deref())
        .await?;
    match header {
        Some(header) => Ok((StatusCode::OK, header).into_response()),
        None => Err(AppError::not_found(format!(
            "no header for `{container}/{object}`"
        ))),
    }
}

/// Map object metadata to response headers.
fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    if let Ok(value) = HeaderValue::from_str(&meta.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(size) = meta.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.checksum)) {
        headers.insert(header::ETAG, value);
    }
    if let Some(modified) = chrono::DateTime::from_timestamp(meta.mtime as i64, 0) {
        let value = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if let Some(range) = meta.content_range.as_deref() {
        if let Ok(value) = HeaderValue::from_str(range) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
}
