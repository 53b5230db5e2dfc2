//! Storage account addressing.

/// Endpoint and token used for every request against one storage account.
#[derive(Clone, PartialEq, Eq)]
pub struct SwiftAccount {
    /// Account URL, e.g. `https://object.example.org/swift/v1/AUTH_<project>`.
    pub host: String,

    /// Scoped token sent as `X-Auth-Token`.
    pub token: String,
}

impl SwiftAccount {
    /// Address `project` through a session endpoint.
    ///
    /// Shared containers live in other accounts on the same cluster, so when
    /// the endpoint does not already name the project its last path segment
    /// is swapped for `AUTH_<project>`.
    pub fn for_project(endpoint: &str, token: &str, project: &str) -> Self {
        let trimmed = endpoint.trim_end_matches('/');
        let host = if trimmed.contains(project) {
            trimmed.to_string()
        } else {
            match trimmed.rsplit_once('/') {
                Some((base, _)) => format!("{base}/AUTH_{project}"),
                None => format!("AUTH_{project}"),
            }
        };
        Self {
            host,
            token: token.to_string(),
        }
    }
}

impl std::fmt::Debug for SwiftAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwiftAccount")
            .field("host", &self.host)
            .field("token", &"<redacted>")
            .finish()
    }
}
