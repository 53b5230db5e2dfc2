//! Session login and logout.
//!
//! - POST   /{project}  form `token` -> rescoped session, `RUNNER_SESSION_ID` cookie
//! - DELETE /{project}  -> 204, cancels the session's open uploads

use axum::{
    Form,
    extract::{Path, Query, State, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::{SESSION_COOKIE, SessionQuery, session_id};
use crate::{errors::AppError, services::transfer_service::TransferService};

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub token: String,
}

/// `POST /{project}`
pub async fn login(
    State(service): State<TransferService>,
    Path(project): Path<String>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Response, AppError> {
    let Form(form) =
        form.map_err(|_| AppError::unauthorized("Login token or project missing"))?;
    let session = service.login(&project, &form.token).await?;

    let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly", session.id);
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|_| AppError::internal("session id is not a valid cookie value"))?;
    let mut response = (StatusCode::OK, "OK").into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

/// `DELETE /{project}`
pub async fn logout(
    State(service): State<TransferService>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> StatusCode {
    if let Some(id) = session_id(&headers, &query) {
        service.logout(&id).await;
    }
    StatusCode::NO_CONTENT
}
