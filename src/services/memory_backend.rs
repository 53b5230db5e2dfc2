//! In-memory Swift emulation used by the service and handler tests.
//!
//! Accounts are keyed by host. Objects written with `X-Object-Manifest` read
//! back as the concatenation of every object under the manifest prefix, in
//! name order, like Swift dynamic large objects.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};

use super::swift::{
    BackendError, BackendResponse, BackendResult, ByteStream, Listing, ObjectBackend,
};
use crate::models::account::SwiftAccount;

pub const MANIFEST_HEADER: &str = "x-object-manifest";
pub const FIXED_TIMESTAMP: &str = "1700000000.00000";

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub headers: HeaderMap,
}

impl StoredObject {
    pub fn manifest(&self) -> Option<&str> {
        self.headers
            .get(MANIFEST_HEADER)
            .and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub method: &'static str,
    pub host: String,
    pub container: String,
    pub object: Option<String>,
}

type ContainerKey = (String, String);

#[derive(Default)]
struct State {
    containers: BTreeMap<ContainerKey, BTreeMap<String, StoredObject>>,
    log: Vec<LoggedRequest>,
    fail_puts_under: Option<String>,
    container_puts: Option<StatusCode>,
    manifest_puts: Option<StatusCode>,
    strip_etags: bool,
}

pub struct MemoryBackend {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn host_key(account: &SwiftAccount) -> String {
    account.host.trim_end_matches('/').to_string()
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: 10_000,
        }
    }

    /// Limit listing pages so marker paging gets exercised.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn create_container(&self, account: &SwiftAccount, container: &str) {
        self.state
            .lock()
            .unwrap()
            .containers
            .entry((host_key(account), container.to_string()))
            .or_default();
    }

    pub fn insert_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        name: &str,
        data: impl Into<Bytes>,
        headers: HeaderMap,
    ) {
        self.state
            .lock()
            .unwrap()
            .containers
            .entry((host_key(account), container.to_string()))
            .or_default()
            .insert(
                name.to_string(),
                StoredObject {
                    data: data.into(),
                    headers,
                },
            );
    }

    pub fn object(&self, account: &SwiftAccount, container: &str, name: &str) -> Option<StoredObject> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(&(host_key(account), container.to_string()))
            .and_then(|objects| objects.get(name).cloned())
    }

    pub fn object_names(&self, account: &SwiftAccount, container: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(&(host_key(account), container.to_string()))
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_container(&self, account: &SwiftAccount, container: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .containers
            .contains_key(&(host_key(account), container.to_string()))
    }

    /// Logical content of an object, resolving manifests.
    pub fn read(&self, account: &SwiftAccount, container: &str, name: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        let host = host_key(account);
        resolve(&state, &host, container, name).map(|(data, _)| data)
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state.lock().unwrap().log.clone()
    }

    /// Object writes whose name starts with `prefix` answer 503.
    pub fn fail_puts_under(&self, prefix: &str) {
        self.state.lock().unwrap().fail_puts_under = Some(prefix.to_string());
    }

    /// Container creation answers `status`. A conflict still leaves the
    /// container in place, as if another writer had just created it.
    pub fn answer_container_puts(&self, status: StatusCode) {
        self.state.lock().unwrap().container_puts = Some(status);
    }

    /// Writes carrying `X-Object-Manifest` answer `status` and store nothing.
    pub fn answer_manifest_puts(&self, status: StatusCode) {
        self.state.lock().unwrap().manifest_puts = Some(status);
    }

    /// Reads stop carrying an `ETag` header.
    pub fn strip_etags(&self) {
        self.state.lock().unwrap().strip_etags = true;
    }

    fn record(&self, method: &'static str, account: &SwiftAccount, container: &str, object: Option<&str>) {
        self.state.lock().unwrap().log.push(LoggedRequest {
            method,
            host: host_key(account),
            container: container.to_string(),
            object: object.map(str::to_string),
        });
    }
}

fn bytes_body(data: Bytes) -> ByteStream {
    futures::stream::once(futures::future::ready(Ok(data))).boxed()
}

fn resolve(state: &State, host: &str, container: &str, name: &str) -> Option<(Bytes, HeaderMap)> {
    let object = state
        .containers
        .get(&(host.to_string(), container.to_string()))?
        .get(name)?;
    let Some(manifest) = object.manifest() else {
        return Some((object.data.clone(), object.headers.clone()));
    };

    let (segments_container, prefix) = manifest.split_once('/').unwrap_or((manifest, ""));
    let mut data = BytesMut::new();
    if let Some(segments) = state
        .containers
        .get(&(host.to_string(), segments_container.to_string()))
    {
        for (_, segment) in segments.iter().filter(|(k, _)| k.starts_with(prefix)) {
            data.extend_from_slice(&segment.data);
        }
    }
    Some((data.freeze(), object.headers.clone()))
}

fn parse_range(range: &str, len: usize) -> Option<(usize, usize)> {
    let bounds = range.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse::<usize>().ok()?.min(len.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head_container(
        &self,
        account: &SwiftAccount,
        container: &str,
    ) -> BackendResult<StatusCode> {
        self.record("HEAD", account, container, None);
        Ok(if self.has_container(account, container) {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        })
    }

    async fn put_container(
        &self,
        account: &SwiftAccount,
        container: &str,
    ) -> BackendResult<StatusCode> {
        self.record("PUT", account, container, None);
        let forced = self.state.lock().unwrap().container_puts;
        if let Some(status) = forced {
            if status == StatusCode::CONFLICT {
                self.create_container(account, container);
            }
            return Ok(status);
        }
        let existed = self.has_container(account, container);
        self.create_container(account, container);
        Ok(if existed {
            StatusCode::ACCEPTED
        } else {
            StatusCode::CREATED
        })
    }

    async fn list_objects(
        &self,
        account: &SwiftAccount,
        container: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
    ) -> BackendResult<Listing> {
        self.record("GET", account, container, None);
        let state = self.state.lock().unwrap();
        let Some(objects) = state
            .containers
            .get(&(host_key(account), container.to_string()))
        else {
            return Ok(Listing {
                status: StatusCode::NOT_FOUND,
                names: Vec::new(),
            });
        };

        let names: Vec<String> = objects
            .keys()
            .filter(|name| marker.is_none_or(|m| name.as_str() > m))
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .take(self.page_size)
            .cloned()
            .collect();
        let status = if names.is_empty() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::OK
        };
        Ok(Listing { status, names })
    }

    async fn get_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
        range: Option<&str>,
    ) -> BackendResult<BackendResponse> {
        self.record("GET", account, container, Some(object));
        let (found, strip_etags) = {
            let state = self.state.lock().unwrap();
            (
                resolve(&state, &host_key(account), container, object),
                state.strip_etags,
            )
        };
        let Some((data, stored)) = found else {
            return Ok(BackendResponse {
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                body: bytes_body(Bytes::new()),
            });
        };

        let mut headers = stored;
        if !strip_etags {
            let etag = format!("{:x}", md5::compute(&data));
            headers.insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
        }
        headers.insert(
            HeaderName::from_static("x-timestamp"),
            HeaderValue::from_static(FIXED_TIMESTAMP),
        );

        let total = data.len();
        let (status, body) = match range.and_then(|r| parse_range(r, total)) {
            Some((start, end)) => {
                headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).unwrap(),
                );
                (StatusCode::PARTIAL_CONTENT, data.slice(start..=end))
            }
            None => (StatusCode::OK, data),
        };
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        Ok(BackendResponse {
            status,
            headers,
            body: bytes_body(body),
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
        self.record("PUT", account, container, Some(object));
        let parts: Vec<Bytes> = body.try_collect().await.map_err(BackendError::Io)?;
        let mut data = BytesMut::new();
        for part in parts {
            data.extend_from_slice(&part);
        }

        let mut state = self.state.lock().unwrap();
        if state
            .fail_puts_under
            .as_deref()
            .is_some_and(|prefix| object.starts_with(prefix))
        {
            return Ok(StatusCode::SERVICE_UNAVAILABLE);
        }
        if let Some(status) = state.manifest_puts {
            if headers.contains_key(MANIFEST_HEADER) {
                return Ok(status);
            }
        }
        let Some(objects) = state
            .containers
            .get_mut(&(host_key(account), container.to_string()))
        else {
            return Ok(StatusCode::NOT_FOUND);
        };

        let mut kept = HeaderMap::new();
        for (name, value) in headers.iter() {
            let keep = name == header::CONTENT_TYPE
                || name.as_str() == MANIFEST_HEADER
                || name.as_str().starts_with("x-object-meta-");
            if keep {
                kept.insert(name.clone(), value.clone());
            }
        }
        objects.insert(
            object.to_string(),
            StoredObject {
                data: data.freeze(),
                headers: kept,
            },
        );
        Ok(StatusCode::CREATED)
    }

    async fn delete_object(
        &self,
        account: &SwiftAccount,
        container: &str,
        object: &str,
    ) -> BackendResult<StatusCode> {
        self.record("DELETE", account, container, Some(object));
        let mut state = self.state.lock().unwrap();
        let removed = state
            .containers
            .get_mut(&(host_key(account), container.to_string()))
            .and_then(|objects| objects.remove(object));
        Ok(if removed.is_some() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::NOT_FOUND
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::swift::list_all;

    fn account() -> SwiftAccount {
        SwiftAccount {
            host: "http://mem/v1/AUTH_p".into(),
            token: "t".into(),
        }
    }

    #[tokio::test]
    async fn manifest_reads_concatenate_segments() {
        let backend = MemoryBackend::new();
        let acc = account();
        backend.insert_object(&acc, "c_segments", "o/g/00000002", "world", HeaderMap::new());
        backend.insert_object(&acc, "c_segments", "o/g/00000001", "hello ", HeaderMap::new());
        let mut headers = HeaderMap::new();
        headers.insert(MANIFEST_HEADER, HeaderValue::from_static("c_segments/o/g/"));
        backend.insert_object(&acc, "c", "o", Bytes::new(), headers);

        assert_eq!(backend.read(&acc, "c", "o").unwrap(), "hello world");

        let resp = backend.get_object(&acc, "c", "o", Some("bytes=6-")).await.unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.header("content-range"), Some("bytes 6-10/11"));
    }

    #[tokio::test]
    async fn listing_pages_follow_marker() {
        let backend = MemoryBackend::new().with_page_size(2);
        let acc = account();
        for name in ["a", "b", "c", "d", "e"] {
            backend.insert_object(&acc, "c", name, "x", HeaderMap::new());
        }

        let page = backend.list_objects(&acc, "c", None, Some("b")).await.unwrap();
        assert_eq!(page.names, vec!["c", "d"]);

        let all = list_all(&backend, &acc, "c", None).await.unwrap();
        assert_eq!(all.names, vec!["a", "b", "c", "d", "e"]);

        let missing = list_all(&backend, &acc, "nope", None).await.unwrap();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }
}
