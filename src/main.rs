//! WhatsApp Business CRM - Main Entry Point
//!
//! Starts:
//! 1. The HTTP server (REST API, Meta webhook, inbox WebSocket, media files)
//! 2. The background task workers (webhook processing, sends, AI replies)

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wa_crm::ai::{AiBotService, DefaultProviderFactory};
use wa_crm::api::{self, AppState};
use wa_crm::media::MediaStore;
use wa_crm::pipeline::Pipeline;
use wa_crm::queue::{self, TaskQueue, WorkerSettings};
use wa_crm::realtime::InboxHub;
use wa_crm::whatsapp_api::GraphApiClient;
use wa_crm::{CrmConfig, CrmStore, FieldCipher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wa_crm=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 WhatsApp CRM starting...");

    // Load configuration
    let config = Arc::new(CrmConfig::from_env()?);
    info!("📋 Configuration loaded");
    if config.debug_mode {
        info!("🐛 Debug mode: webhook payloads will be logged");
    }

    // Storage
    let cipher = FieldCipher::new(&config.encryption_key).context("invalid ENCRYPTION_KEY")?;
    let store = Arc::new(CrmStore::new(&config.database_path, cipher)?);
    info!("📦 Database opened at {:?}", config.database_path);

    let media = MediaStore::new(&config.media_root, &config.media_url);
    tokio::fs::create_dir_all(media.root()).await?;
    info!("🗂️ Media stored under {:?}", media.root());

    // Shared services
    let whatsapp = Arc::new(GraphApiClient::new(config.graph_api_base.clone()));
    let hub = InboxHub::new();
    let (task_queue, receiver) = TaskQueue::new();
    let ai = AiBotService::new(store.clone(), Arc::new(DefaultProviderFactory));

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        store.clone(),
        whatsapp.clone(),
        ai,
        media.clone(),
        hub.clone(),
        task_queue.clone(),
    ));

    // Spawn task workers
    let workers = queue::start_workers(
        task_queue.clone(),
        receiver,
        pipeline,
        WorkerSettings::from_config(&config),
    );

    // Spawn HTTP server
    let http_addr: SocketAddr = config.http_addr.parse()?;
    let state = AppState::new(config.clone(), store, task_queue, hub, media, whatsapp);
    let http_server = spawn_http_server(http_addr, state);

    info!("🌐 HTTP server listening on {}", http_addr);
    info!("🔌 Inbox WebSocket at ws://{}/ws/chat/inbox/", http_addr);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("📢 Shutdown signal received"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }

    // Graceful shutdown
    info!("🛑 Shutting down...");
    http_server.abort();
    for worker in workers {
        worker.abort();
    }

    info!("✅ WhatsApp CRM stopped");
    Ok(())
}

/// Spawn the HTTP server
fn spawn_http_server(addr: SocketAddr, state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = api::run_server(addr, state).await {
            tracing::error!("HTTP server error: {}", e);
        }
    })
}
