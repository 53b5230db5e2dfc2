//! Keystone token rescoping used when a session is opened.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{TransferError, TransferResult};

const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";

/// Project-scoped token and the storage endpoint it grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedToken {
    pub token: String,
    pub endpoint: String,
}

#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchange `token` for one scoped to `project`.
    async fn rescope(&self, token: &str, project: &str) -> TransferResult<ScopedToken>;
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: TokenDetails,
}

#[derive(Debug, Deserialize)]
struct TokenDetails {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    url: String,
}

/// First public object-store endpoint of the catalog.
fn storage_endpoint(catalog: &[CatalogEntry]) -> Option<&str> {
    catalog
        .iter()
        .filter(|entry| entry.kind == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| endpoint.interface == "public")
        .map(|endpoint| endpoint.url.as_str())
}

pub struct KeystoneClient {
    http: reqwest::Client,
    auth_url: String,
}

impl KeystoneClient {
    pub fn new(auth_url: &str) -> TransferResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("upload-runner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            auth_url: auth_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenExchange for KeystoneClient {
    async fn rescope(&self, token: &str, project: &str) -> TransferResult<ScopedToken> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["token"],
                    "token": { "id": token },
                },
                "scope": { "project": { "id": project } },
            }
        });
        let resp = self
            .http
            .post(format!("{}/auth/tokens", self.auth_url))
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(TransferError::Unauthorized("Token is not valid".into()));
            }
            StatusCode::FORBIDDEN => {
                return Err(TransferError::Forbidden(
                    "No access to service with token.".into(),
                ));
            }
            status if !status.is_success() => {
                return Err(TransferError::Identity {
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let scoped = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Unauthorized("Scoped token missing".into()))?;
        let details: TokenBody = resp.json().await?;
        let endpoint = storage_endpoint(&details.token.catalog)
            .ok_or_else(|| TransferError::Forbidden("No object storage endpoint for project".into()))?
            .to_string();

        tracing::debug!(%project, %endpoint, "token rescoped");
        Ok(ScopedToken {
            token: scoped,
            endpoint,
        })
    }
}

#[cfg(test)]
pub use fixed::FixedExchange;
