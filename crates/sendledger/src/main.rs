//! Campaign delivery daemon.
//!
//! Polls for due campaigns, freezes their audiences, and drives queued
//! delivery records through the mail API in batches. An HTTP listener
//! ingests signed delivery events from the transport. Campaigns left in
//! `Sending` by a previous run are resumed on startup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};

use sendledger_core::{Dispatcher, Store};
use sendledger_transport::HttpTransport;

mod config;
mod ingest;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(config::default_path, PathBuf::from);
    let config = config::load(&config_path)?;

    if let Some(parent) = PathBuf::from(&config.database_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }

    let store = Store::open(&config.database_path)
        .await
        .with_context(|| format!("opening database at {}", config.database_path))?;

    let transport = HttpTransport::new(&config.transport.base_url, &config.transport.api_key)?;
    let dispatcher = Dispatcher::new(
        &store,
        Arc::new(transport),
        &config.sender_address,
        config.policy(),
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding event listener to {}", config.listen_addr))?;
    let events = ingest::router(ingest::IngestState::new(
        store.tracker(),
        &config.transport.webhook_secret,
    ));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, events).await {
            error!(error = %err, "event listener stopped");
        }
    });

    info!(
        database = %config.database_path,
        listen = %config.listen_addr,
        "sendledger started"
    );

    // Pick up campaigns a previous run left mid-dispatch.
    for campaign in store.campaigns().in_flight().await? {
        if let Some(id) = campaign.id {
            info!(campaign_id = %id, name = %campaign.name, "resuming interrupted campaign");
            if let Err(err) = dispatcher.dispatch(id).await {
                error!(campaign_id = %id, error = %err, "resume failed");
            }
        }
    }

    let poll = Duration::from_secs(config.poll_interval_secs);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            () = tokio::time::sleep(poll) => {
                if let Err(err) = run_due_campaigns(&store, &dispatcher).await {
                    error!(error = %err, "dispatch pass failed");
                }
            }
        }
    }

    Ok(())
}

async fn run_due_campaigns(store: &Store, dispatcher: &Dispatcher) -> Result<()> {
    for campaign in store.campaigns().due(Utc::now()).await? {
        let Some(id) = campaign.id else { continue };
        info!(campaign_id = %id, name = %campaign.name, "dispatching due campaign");
        match dispatcher.dispatch(id).await {
            Ok(summary) => info!(
                campaign_id = %id,
                submitted = summary.submitted,
                failed = summary.failed,
                "campaign dispatched"
            ),
            // One bad campaign must not stall the others.
            Err(err) => error!(campaign_id = %id, error = %err, "campaign dispatch failed"),
        }
    }
    Ok(())
}
