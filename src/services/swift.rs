//! Swift object-storage client.
//!
//! [`ObjectBackend`] is the narrow slice of the Swift REST API the transfer
//! engine relies on. [`SwiftClient`] implements it over `reqwest`; tests use
//! an in-memory emulation instead.

use std::io;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{Method, Url};

use crate::models::account::SwiftAccount;

/// Transport-level failures talking to the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage stream failed: {0}")]
    Io(#[from] io::Error),

    #[error("invalid storage url `{0}`")]
    InvalidUrl(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Streamed object payload.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Status, headers and streamed body of an object read.
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl BackendResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// One page of a container listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub status: StatusCode,
    pub names: Vec<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn head_container(
        &self,
        account: &SwiftAccount,
        container: &str,
    ) -> BackendResult<StatusCode>;

    async fn put_container(
        &self,
        account: &SwiftAccount,
        container: &str,
    ) -> BackendResult<StatusCode>;

    /// List object names after `marker`, optionally restricted to `prefix`.
    /// A `204` page is an empty container.
    async fn list_objects(
        &self,
        account: &SwiftAccount,
        container: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> BackendResult<Listing>;

    /// Streaming read; `range` is passed through as the `Range` header.
    async fn get_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
        range: Option<&str>,
    ) -> BackendResult<BackendResponse>;

    async fn put_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
        headers: HeaderMap,
        body: ByteStream,
    ) -> BackendResult<StatusCode>;

    async fn delete_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
    ) -> BackendResult<StatusCode>;
}

/// Collect every name in `container` by following listing markers.
///
/// Returns the status of the first page when it is not a success, so callers
/// can tell a missing container from an empty one.
pub async fn list_all(
    backend: &dyn ObjectBackend,
    account: &SwiftAccount,
    container: &str,
    prefix: Option<&str>,
) -> BackendResult<Listing> {
    let mut all = Listing {
        status: StatusCode::OK,
        names: Vec::new(),
    };
    let mut marker: Option<String> = None;
    loop {
        let page = backend
            .list_objects(account, container, prefix, marker.as_deref())
            .await?;
        if !page.status.is_success() {
            if marker.is_none() {
                all.status = page.status;
            }
            break;
        }
        if marker.is_none() {
            all.status = page.status;
        }
        match page.names.last() {
            Some(last) => marker = Some(last.clone()),
            None => break,
        }
        all.names.extend(page.names);
    }
    Ok(all)
}

/// Status codes that mean a container is usable after a create attempt.
pub fn container_ready(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::CONFLICT
}

/// Zero-byte body for manifests and empty objects.
pub fn empty_body() -> ByteStream {
    futures::stream::empty().boxed()
}

/// `reqwest` implementation of [`ObjectBackend`].
#[derive(Clone)]
pub struct SwiftClient {
    http: reqwest::Client,
}

impl SwiftClient {
    pub fn new() -> BackendResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("upload-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    /// Build `<host>/<container>[/<object>]`, encoding each path segment
    /// while keeping the slashes of pseudo-directory object names.
    fn url(&self, account: &SwiftAccount, container: &str, object: Option<&str>) -> BackendResult<Url> {
        let mut url =
            Url::parse(&account.host).map_err(|_| BackendError::InvalidUrl(account.host.clone()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::InvalidUrl(account.host.clone()))?;
            segments.pop_if_empty().push(container);
            if let Some(object) = object {
                segments.extend(object.split('/'));
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, account: &SwiftAccount) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("X-Auth-Token", &account.token)
    }
}

#[async_trait]
impl ObjectBackend for SwiftClient {
    async fn head_container(
        &self,
        account: &SwiftAccount,
        container: &str,
    ) -> BackendResult<StatusCode> {
        let url = self.url(account, container, None)?;
        let resp = self.request(Method::HEAD, url, account).send().await?;
        Ok(resp.status())
    }

    async fn put_container(
        &self,
        account: &SwiftAccount,
        container: &str,
    ) -> BackendResult<StatusCode> {
        let url = self.url(account, container, None)?;
        let resp = self
            .request(Method::PUT, url, account)
            .header(header::CONTENT_LENGTH, "0")
            .send()
            .await?;
        tracing::debug!(container, status = %resp.status(), "container create");
        Ok(resp.status())
    }

    async fn list_objects(
        &self,
        account: &SwiftAccount,
        container: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> BackendResult<Listing> {
        let url = self.url(account, container, None)?;
        let mut query: Vec<(&str, &str)> = vec![("format", "plain")];
        if let Some(prefix) = prefix {
            query.push(("prefix", prefix));
        }
        if let Some(marker) = marker {
            query.push(("marker", marker));
        }

        let resp = self
            .request(Method::GET, url, account)
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Ok(Listing {
                status,
                names: Vec::new(),
            });
        }

        let text = resp.text().await?;
        let names = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Listing { status, names })
    }

    async fn get_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
        range: Option<&str>,
    ) -> BackendResult<BackendResponse> {
        let url = self.url(account, container, Some(object))?;
        let mut req = self
            .request(Method::GET, url, account)
            .header(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if let Some(range) = range {
            req = req.header(header::RANGE, range);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes_stream().map_err(io::Error::other).boxed();
        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }

    async fn put_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
        headers: HeaderMap,
        body: ByteStream,
    ) -> BackendResult<StatusCode> {
        let url = self.url(account, container, Some(object))?;
        let resp = self
            .request(Method::PUT, url, account)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        Ok(resp.status())
    }

    async fn delete_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
    ) -> BackendResult<StatusCode> {
        let url = self.url(account, container, Some(object))?;
        let resp = self.request(Method::DELETE, url, account).send().await?;
        Ok(resp.status())
    }
}
