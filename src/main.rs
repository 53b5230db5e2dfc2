use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    keystone::KeystoneClient,
    swift::SwiftClient,
    transfer_service::TransferService,
    vault::{VaultClient, VaultSettings},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        auth_url = %cfg.auth_url,
        vault_url = %cfg.vault_url,
        disable_auth = cfg.disable_auth,
        limits = ?cfg.limits,
        "Starting upload runner"
    );
    if cfg.api_tokens.is_empty() && !cfg.disable_auth {
        tracing::warn!("No API tokens configured, every signed request will be rejected");
    }

    // --- Initialize clients ---
    let backend = SwiftClient::new().context("building storage client")?;
    let vault = VaultClient::new(VaultSettings {
        url: cfg.vault_url.clone(),
        role: cfg.vault_role.clone(),
        secret: cfg.vault_secret.clone(),
        key_name: cfg.vault_key_name.clone(),
    })
    .context("building key management client")?;
    let keystone = KeystoneClient::new(&cfg.auth_url).context("building identity client")?;

    // --- Initialize core service ---
    let service = TransferService::new(
        Arc::new(backend),
        Arc::new(vault),
        Arc::new(keystone),
        cfg.limits,
        cfg.api_tokens.clone(),
        cfg.disable_auth,
    );

    // --- Build router ---
    let app: Router = routes::routes::routes(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
