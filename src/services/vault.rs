//! Key-management client for out-of-band crypt4gh headers.
//!
//! Headers, project public keys and whitelisted keys live in a Vault
//! `c4ghtransit` secrets engine. The engine itself only needs the
//! [`HeaderStore`] seam.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::errors::{TransferError, TransferResult};

/// Service name the headers are registered under.
pub const SERVICE_NAME: &str = "SD-Connect";

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_RENEW_MARGIN: Duration = Duration::from_secs(10);

#[async_trait]
pub trait HeaderStore: Send + Sync {
    /// Header stored for `project/container/path`, `None` when there is none.
    async fn get_header(
        &self,
        project: &str,
        container: &str,
        path: &str,
        owner: Option<&str>,
    ) -> TransferResult<Option<String>>;

    async fn put_header(
        &self,
        project: &str,
        container: &str,
        path: &str,
        header: &str,
        owner: Option<&str>,
    ) -> TransferResult<()>;

    /// Base64 crypt4gh public key of `project`, created on first use.
    async fn get_public_key(&self, project: &str) -> TransferResult<String>;

    async fn put_whitelist_key(
        &self,
        project: &str,
        flavor: &str,
        public_key: &[u8],
    ) -> TransferResult<()>;

    async fn remove_whitelist_key(&self, project: &str) -> TransferResult<()>;
}

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub url: String,
    pub role: String,
    pub secret: String,
    pub key_name: String,
}

struct CachedToken {
    value: String,
    expires: Instant,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
}

#[derive(Deserialize, Default)]
struct VaultErrors {
    #[serde(default)]
    errors: Vec<String>,
}

pub struct VaultClient {
    http: reqwest::Client,
    settings: VaultSettings,
    token: Mutex<Option<CachedToken>>,
}

impl VaultClient {
    pub fn new(settings: VaultSettings) -> TransferResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            settings,
            token: Mutex::new(None),
        })
    }

    fn url(&self, segments: &[&str]) -> TransferResult<Url> {
        let invalid = || TransferError::KeyManagement {
            status: 500,
            message: format!("invalid key management url `{}`", self.settings.url),
        };
        let mut url = Url::parse(&self.settings.url).map_err(|_| invalid())?;
        {
            let mut path = url.path_segments_mut().map_err(|_| invalid())?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        Ok(url)
    }

    /// AppRole token, renewed when missing or about to expire.
    async fn token(&self) -> TransferResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires > Instant::now() + TOKEN_RENEW_MARGIN {
                return Ok(token.value.clone());
            }
        }

        tracing::debug!("requesting new key management token");
        let resp = self
            .http
            .post(self.url(&["auth/approle/login"])?)
            .json(&json!({
                "role_id": self.settings.role,
                "secret_id": self.settings.secret,
            }))
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body: VaultErrors = resp.json().await.unwrap_or_default();
            let reason = body.errors.into_iter().next().unwrap_or_default();
            tracing::error!(%status, %reason, "key management login failed");
            return Err(TransferError::KeyManagement {
                status: 502,
                message: format!("unable to authenticate: {reason}"),
            });
        }

        let login: LoginResponse = resp.json().await.map_err(map_transport)?;
        let value = login.auth.client_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires: Instant::now() + Duration::from_secs(login.auth.lease_duration),
        });
        Ok(value)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    /// Authenticated request; `None` for 204/404 or an empty body.
    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> TransferResult<Option<Value>> {
        let url = self.url(segments)?;
        let mut attempts = 0;
        loop {
            let token = self.token().await?;
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .query(query)
                .header("X-Vault-Token", token)
                .header("X-Vault-Request", "true")
                .header("Accept", "application/json");
            if let Some(body) = &body {
                req = req.json(body);
            }

            let resp = req.send().await.map_err(map_transport)?;
            let status = resp.status();
            tracing::debug!(%method, path = url.path(), %status, "key management request");

            match status {
                StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => return Ok(None),
                StatusCode::FORBIDDEN => {
                    attempts += 1;
                    self.forget_token().await;
                    if attempts >= MAX_RETRIES {
                        return Err(TransferError::KeyManagement {
                            status: 403,
                            message: "permission denied".into(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                s if s.is_success() => {
                    let bytes = resp.bytes().await.map_err(map_transport)?;
                    if bytes.is_empty() {
                        return Ok(None);
                    }
                    let value = serde_json::from_slice(&bytes).map_err(|err| {
                        TransferError::KeyManagement {
                            status: 502,
                            message: format!("unreadable response: {err}"),
                        }
                    })?;
                    return Ok(Some(value));
                }
                s => {
                    let errors: VaultErrors = resp.json().await.unwrap_or_default();
                    let message = errors
                        .errors
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| s.to_string());
                    return Err(TransferError::KeyManagement {
                        status: s.as_u16(),
                        message,
                    });
                }
            }
        }
    }

    async fn fetch_public_key(&self, project: &str) -> TransferResult<Option<String>> {
        let Some(body) = self
            .request(Method::GET, &["c4ghtransit/keys", project], &[], None)
            .await?
        else {
            return Ok(None);
        };
        let data = &body["data"];
        let latest = match &data["latest_version"] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return Ok(None),
        };
        Ok(data["keys"][latest.as_str()]["public_key_c4gh_64"]
            .as_str()
            .filter(|key| !key.is_empty())
            .map(str::to_string))
    }
}

fn map_transport(err: reqwest::Error) -> TransferError {
    if err.is_timeout() {
        TransferError::KeyManagementTimeout
    } else {
        TransferError::from(err)
    }
}

#[async_trait]
impl HeaderStore for VaultClient {
    async fn get_header(
        &self,
        project: &str,
        container: &str,
        path: &str,
        owner: Option<&str>,
    ) -> TransferResult<Option<String>> {
        let mut query = vec![("service", SERVICE_NAME), ("key", self.settings.key_name.as_str())];
        if let Some(owner) = owner {
            query.push(("owner", owner));
        }
        let body = self
            .request(
                Method::GET,
                &["c4ghtransit/files", project, container, path],
                &query,
                None,
            )
            .await?;
        Ok(body.and_then(|body| {
            body["data"]["headers"]["1"]["header"]
                .as_str()
                .filter(|header| !header.is_empty())
                .map(str::to_string)
        }))
    }

    async fn put_header(
        &self,
        project: &str,
        container: &str,
        path: &str,
        header: &str,
        owner: Option<&str>,
    ) -> TransferResult<()> {
        let mut body = json!({ "header": header });
        if let Some(owner) = owner {
            body["owner"] = Value::String(owner.to_string());
        }
        self.request(
            Method::POST,
            &["c4ghtransit/files", project, container, path],
            &[],
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn get_public_key(&self, project: &str) -> TransferResult<String> {
        if let Some(key) = self.fetch_public_key(project).await? {
            return Ok(key);
        }

        tracing::debug!(project, "no public key found, creating one");
        self.request(
            Method::POST,
            &["c4ghtransit/keys", project],
            &[],
            Some(json!({ "flavor": "crypt4gh" })),
        )
        .await?;
        self.fetch_public_key(project)
            .await?
            .ok_or_else(|| TransferError::KeyManagement {
                status: 502,
                message: format!("no public key for project {project}"),
            })
    }

    async fn put_whitelist_key(
        &self,
        project: &str,
        flavor: &str,
        public_key: &[u8],
    ) -> TransferResult<()> {
        self.request(
            Method::POST,
            &[
                "c4ghtransit/whitelist",
                project,
                SERVICE_NAME,
                &self.settings.key_name,
            ],
            &[],
            Some(json!({ "flavor": flavor, "pubkey": STANDARD.encode(public_key) })),
        )
        .await?;
        Ok(())
    }

    async fn remove_whitelist_key(&self, project: &str) -> TransferResult<()> {
        self.request(
            Method::DELETE,
            &[
                "c4ghtransit/whitelist",
                project,
                SERVICE_NAME,
                &self.settings.key_name,
            ],
            &[],
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub use memory::{HeaderCall, MemoryHeaderStore};


#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> VaultClient {
        VaultClient::new(VaultSettings {
            url: url.into(),
            role: "role".into(),
            secret: "secret".into(),
            key_name: "runner".into(),
        })
        .unwrap()
    }

    #[test]
    fn file_paths_are_segment_encoded() {
        let vault = client("http://vault:8200/v1/");
        let url = vault
            .url(&["c4ghtransit/files", "proj", "box", "dir/a b.c4gh"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://vault:8200/v1/c4ghtransit/files/proj/box/dir/a%20b.c4gh"
        );
    }

    #[tokio::test]
    async fn memory_store_round_trips_headers() {
        let store = MemoryHeaderStore::default();
        assert_eq!(store.get_header("p", "c", "o", None).await.unwrap(), None);
        store.put_header("p", "c", "o", "aGRy", Some("owner")).await.unwrap();
        assert_eq!(
            store.get_header("p", "c", "o", None).await.unwrap().as_deref(),
            Some("aGRy")
        );
        assert_eq!(store.calls().len(), 3);
    }
}
