use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::models::upload::{CHUNK_SIZE, SEGMENT_SIZE};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub auth_url: String,
    pub vault_url: String,
    pub vault_role: String,
    pub vault_secret: String,
    pub vault_key_name: String,
    /// Shared secrets accepted for request signatures.
    pub api_tokens: Vec<String>,
    pub disable_auth: bool,
    pub limits: TransferLimits,
}

/// Transfer geometry and queue sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub segment_size: u64,
    pub chunk_size: u64,
    /// Chunks an upload may hold before `add_chunks` stops asking for more.
    pub cache_depth: usize,
    /// Seconds a feeder waits for a chunk before asking for it again.
    pub chunk_timeout: Duration,
    /// Bytes per download queue item.
    pub download_chunk: usize,
    /// Download queue capacity in items.
    pub proxy_queue: usize,
    /// Files queued ahead of the archive writer.
    pub archive_queue: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            segment_size: SEGMENT_SIZE,
            chunk_size: CHUNK_SIZE,
            cache_depth: 160,
            chunk_timeout: Duration::from_secs(10),
            download_chunk: 128 * 1024,
            proxy_queue: 256,
            archive_queue: 3,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Swift transfer gateway")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_RUNNER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_RUNNER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Keystone endpoint (overrides OS_AUTH_URL)
    #[arg(long)]
    pub auth_url: Option<String>,

    /// Skip request signature checks
    #[arg(long)]
    pub disable_auth: bool,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::from_env(args)
    }

    fn from_env(args: Args) -> Result<Self> {
        let defaults = TransferLimits::default();
        let limits = TransferLimits {
            cache_depth: env_or("SWIFT_UPLOAD_RUNNER_Q_DEPTH", defaults.cache_depth)?,
            proxy_queue: env_or("SWIFT_UPLOAD_RUNNER_PROXY_Q_SIZE", defaults.proxy_queue)?,
            chunk_timeout: Duration::from_secs(env_or(
                "SWIFT_UPLOAD_RUNNER_CHUNK_TIMEOUT",
                defaults.chunk_timeout.as_secs(),
            )?),
            ..defaults
        };

        let api_tokens = env_string("SWIFT_UI_API_AUTH_TOKENS", "")
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();

        let disable_auth = args.disable_auth
            || env::var("SWIFT_UPLOAD_RUNNER_DISABLE_AUTH")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);

        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("UPLOAD_RUNNER_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_or("UPLOAD_RUNNER_PORT", 9092)?,
            },
            auth_url: args
                .auth_url
                .unwrap_or_else(|| env_string("OS_AUTH_URL", "http://localhost:5000/v3")),
            vault_url: env_string("VAULT_URL", "http://localhost:8200/v1"),
            vault_role: env_string("VAULT_ROLE", ""),
            vault_secret: env_string("VAULT_SECRET", ""),
            vault_key_name: env_string("VAULT_KEY_NAME", ""),
            api_tokens,
            disable_auth,
            limits,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
