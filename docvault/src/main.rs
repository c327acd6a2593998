use async_trait::async_trait;
use axum::{routing::get, serve, Router};
use clap::Parser;
use docvault_core::events::EventBus;
use docvault_core::folders::FolderGraph;
use docvault_core::indexer::{IndexFeed, IndexSink, IndexUpdate};
use docvault_core::versions::VersionStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use docvault::api;

#[derive(Parser)]
#[command(about = "Versioned document store server")]
struct Args {
    /// Directory holding documents, payloads and the folder graph.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: String,
}

/// Default index sink until a real search engine is wired in: every
/// update is visible in the logs.
struct LogSink;

#[async_trait]
impl IndexSink for LogSink {
    async fn deliver(&self, update: IndexUpdate) -> anyhow::Result<()> {
        tracing::info!(
            id = %update.id,
            chain = %update.chain_id,
            deleted = update.deleted,
            name = %update.name,
            "index update"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docvault=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let events = EventBus::new();
    let store = Arc::new(RwLock::new(VersionStore::new(
        args.data_dir.join("documents"),
        events.clone(),
    )?));
    let folders = Arc::new(RwLock::new(FolderGraph::new(
        args.data_dir.join("folders"),
    )?));
    let feed = Arc::new(IndexFeed::new(Arc::new(LogSink), store.clone()));
    feed.spawn_consumer(&events);

    let app = Router::new()
        .merge(api::router(store, folders, feed))
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&args.listen).await?;
    tracing::info!(addr = %args.listen, "listening");
    serve(listener, app.into_make_service()).await?;
    Ok(())
}
