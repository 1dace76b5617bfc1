#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    auth::SessionAuthority,
    config::Config,
    db::LedgerDb,
    ledger::{LedgerService, store},
    retention::spawn_retention_worker,
    server::{AppState, build_router},
};

pub mod auth;
pub mod config;
pub mod db;
pub mod ledger;
pub mod retention;
pub mod server;

pub async fn build_ledger_state(config: Config) -> Result<AppState> {
    let db = match config.db_url.clone() {
        Some(url) => Some(Arc::new(LedgerDb::connect(url.as_str()).await?)),
        None => None,
    };
    let store = match db.clone() {
        Some(db) => store::postgres(db),
        None => store::memory(),
    };
    let sessions = SessionAuthority::from_config(config.session_config());
    let ledger = LedgerService::new_with_policy(store, sessions, config.ledger_policy.clone());

    if let Some(bootstrap) = config.admin_bootstrap.clone() {
        ledger
            .ensure_admin(bootstrap)
            .await
            .context("bootstrap admin account")?;
    }

    Ok(AppState::new(config, ledger, db))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_ledger_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        store_driver = if config.db_url.is_some() { "postgres" } else { "memory" },
        "ledger service listening"
    );
    let retention = config.retention.clone();
    let state = build_ledger_state(config).await?;
    let _retention_worker = spawn_retention_worker(state.ledger().clone(), retention);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
