use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use tower::ServiceExt;

use crate::config::TransferLimits;
use crate::models::account::SwiftAccount;
use crate::routes::routes::routes;
use crate::services::keystone::FixedExchange;
use crate::services::memory_backend::MemoryBackend;
use crate::services::signature::sign_api_request;
use crate::services::transfer_service::TransferService;
use crate::services::vault::MemoryHeaderStore;

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_SECRET: &str = "test-secret";
const ENDPOINT_BASE: &str = "http://mem/v1";

/// Router wired to in-memory storage and key management.
pub struct TestApp {
    pub router: Router,
    pub service: TransferService,
    pub backend: Arc<MemoryBackend>,
    pub headers: Arc<MemoryHeaderStore>,
}

impl TestApp {
    /// Storage account a session for `project` ends up using.
    pub fn account(&self, project: &str) -> SwiftAccount {
        SwiftAccount::for_project(
            &format!("{ENDPOINT_BASE}/AUTH_{project}"),
            &format!("scoped-{TEST_TOKEN}"),
            project,
        )
    }
}

fn build(disable_auth: bool) -> TestApp {
    let backend = Arc::new(MemoryBackend::new());
    let headers = Arc::new(MemoryHeaderStore::default());
    let exchange = Arc::new(FixedExchange {
        valid_token: TEST_TOKEN.to_string(),
        endpoint: ENDPOINT_BASE.to_string(),
    });
    let limits = TransferLimits {
        download_chunk: 1024,
        proxy_queue: 8,
        ..TransferLimits::default()
    };
    let service = TransferService::new(
        backend.clone(),
        headers.clone(),
        exchange,
        limits,
        vec![TEST_SECRET.to_string()],
        disable_auth,
    );
    TestApp {
        router: routes(service.clone()),
        service,
        backend,
        headers,
    }
}

pub fn setup_app() -> TestApp {
    build(false)
}

pub fn setup_app_without_auth() -> TestApp {
    build(true)
}

/// Open a session directly and return its id.
pub async fn login_session(app: &TestApp, project: &str) -> String {
    app.service.login(project, TEST_TOKEN).await.unwrap().id.clone()
}

/// Append `valid` and `signature` for the path of `uri`.
pub fn signed(uri: &str) -> String {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    let sig = sign_api_request(path, Duration::from_secs(60), TEST_SECRET.as_bytes()).unwrap();
    let sep = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{sep}valid={}&signature={}", sig.valid, sig.signature)
}

async fn send(router: Router, req: Request<Body>) -> axum::response::Response {
    router.oneshot(req).await.unwrap()
}

/// Send a signed GET request.
pub async fn get(router: Router, uri: &str) -> axum::response::Response {
    get_with(router, uri, &[]).await
}

/// Send a signed GET request with extra headers.
pub async fn get_with(
    router: Router,
    uri: &str,
    headers: &[(&str, &str)],
) -> axum::response::Response {
    let mut req = Request::builder().method("GET").uri(signed(uri));
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    send(router, req.body(Body::empty()).unwrap()).await
}

pub async fn get_unsigned(router: Router, uri: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(router, req).await
}

/// Send a signed form POST.
pub async fn post_form(router: Router, uri: &str, form: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("POST")
        .uri(signed(uri))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap();
    send(router, req).await
}

/// Send a signed DELETE request.
pub async fn delete(router: Router, uri: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("DELETE")
        .uri(signed(uri))
        .body(Body::empty())
        .unwrap();
    send(router, req).await
}

/// Read full response body into `Vec<u8>`.
pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body")
        .to_vec()
}
