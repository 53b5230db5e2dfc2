pub mod auth_handlers;
pub mod health_handlers;
pub mod object_handlers;
#[cfg(test)]
pub mod test_helpers;
pub mod upload_handlers;

use axum::http::{HeaderMap, header};
use serde::Deserialize;

pub const SESSION_COOKIE: &str = "RUNNER_SESSION_ID";

/// `?session=` fallback for clients that cannot send the cookie.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

/// Session id from the runner cookie, or else from the query string.
pub fn session_id(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .or_else(|| query.session.clone())
}
