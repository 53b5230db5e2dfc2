//! Defines routes for the transfer gateway.
//!
//! ## Structure
//! - **Public**
//!   - `GET    /health`: liveness
//!
//! - **Signed** (every request carries `valid` and `signature`)
//!   - `POST   /{project}`: open a session
//!   - `DELETE /{project}`: close a session
//!   - `GET    /cryptic/{project}`: upload WebSocket
//!   - `GET    /header/{project}/{container}/{*object}`: encryption header
//!   - `GET    /{project}/{container}`: container as a tar archive
//!   - `POST   /{project}/{container}`: replicate into the container
//!   - `GET    /{project}/{container}/{*object}`: object download
//!
//! The wildcard `*object` allows pseudo-directory names like `data/2025/run.c4gh`.

use crate::{
    handlers::{
        auth_handlers::{login, logout},
        health_handlers::health,
        object_handlers::{get_container, get_header, get_object, replicate},
        upload_handlers::upload_socket,
    },
    services::{signature::verify_signature, transfer_service::TransferService},
};
use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

const SERVER_NAME: &str = "Swift Browser Runner";

#[derive(Debug, Deserialize)]
struct SignatureQuery {
    valid: Option<String>,
    signature: Option<String>,
}

/// Build the router with shared state (`TransferService`) applied.
pub fn routes(service: TransferService) -> Router {
    let signed = Router::new()
        .route("/cryptic/{project}", get(upload_socket))
        .route("/header/{project}/{container}/{*object}", get(get_header))
        .route("/{project}/{container}/{*object}", get(get_object))
        .route("/{project}/{container}", get(get_container).post(replicate))
        .route("/{project}", post(login).delete(logout))
        .layer(middleware::from_fn_with_state(
            service.clone(),
            signature_middleware,
        ));

    let public = Router::new().route("/health", get(health));

    public
        .merge(signed)
        .layer(middleware::map_response(server_header))
        .with_state(service)
}

async fn signature_middleware(
    State(service): State<TransferService>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if service.disable_auth {
        return next.run(req).await;
    }

    let query = Query::<SignatureQuery>::try_from_uri(req.uri()).ok();
    let (Some(valid), Some(signature)) = query
        .map(|Query(q)| (q.valid, q.signature))
        .unwrap_or((None, None))
    else {
        tracing::debug!(path = %req.uri().path(), "request without signature");
        return (
            StatusCode::UNAUTHORIZED,
            "Query string missing validity or signature",
        )
            .into_response();
    };

    match verify_signature(&service.api_tokens, req.uri().path(), &valid, &signature) {
        Ok(()) => next.run(req).await,
        Err(err) => {
            tracing::info!(path = %req.uri().path(), error = %err, "rejected request signature");
            (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

async fn server_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}
