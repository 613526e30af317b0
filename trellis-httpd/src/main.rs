//! Trellis HTTP Server
//!
//! Deployable wiring for the indexing control plane: loads the index
//! configuration, connects the SPARQL endpoint, the search backend and
//! the text extraction service, pre-builds the eager indexes and then
//! serves the operational endpoints.
//!
//! # Endpoints
//!
//! - `POST /update` - Ingest a delta notification (format 0.0.1)
//! - `POST /indexes/invalidate[?type=..]` - Mark indexes stale
//! - `POST /indexes/update[?type=..]` - Force a rebuild
//! - `GET /health` - Health check
//!
//! The search query surface is served elsewhere; this binary only
//! carries the control plane.
//!
//! # Example
//!
//! ```bash
//! trellis-httpd \
//!   --config-file /config/search.json \
//!   --sparql-endpoint http://database:8890/sparql \
//!   --search-url http://elasticsearch:9200 \
//!   --listen 0.0.0.0:8080
//! ```

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use trellis_auth::AccessScope;
use trellis_client::{
    AttachmentCache, ElasticClient, SearchClient, SparqlPool, TextExtractor, TikaExtractor,
};
use trellis_config::Configuration;
use trellis_indexer::{
    DeltaChangeset, DeltaProcessor, DocumentBuilder, IndexManager, SearchIndex, UpdateHandler,
};

/// Trellis HTTP Server
#[derive(Parser, Debug)]
#[command(name = "trellis-httpd")]
#[command(about = "HTTP server for the trellis indexing control plane")]
struct Args {
    /// Path to the index configuration document
    #[arg(long, default_value = "/config/config.json", env = "TRELLIS_CONFIG_FILE")]
    config_file: String,

    /// SPARQL endpoint URL
    #[arg(
        long,
        default_value = "http://database:8890/sparql",
        env = "TRELLIS_SPARQL_ENDPOINT"
    )]
    sparql_endpoint: String,

    /// Search backend base URL
    #[arg(
        long,
        default_value = "http://elasticsearch:9200",
        env = "TRELLIS_SEARCH_URL"
    )]
    search_url: String,

    /// Text extraction service base URL
    #[arg(long, default_value = "http://tika:9998", env = "TRELLIS_TIKA_URL")]
    tika_url: String,

    /// Directory for the extracted-text cache
    #[arg(long, default_value = "/cache", env = "TRELLIS_ATTACHMENT_CACHE")]
    attachment_cache: String,

    /// Maximum concurrent SPARQL connections
    #[arg(long, default_value = "8", env = "TRELLIS_SPARQL_CONNECTIONS")]
    sparql_connections: usize,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "TRELLIS_LISTEN")]
    listen: SocketAddr,
}

/// Application state shared across handlers.
struct AppState {
    manager: Arc<IndexManager>,
    updates: Arc<UpdateHandler>,
    deltas: Arc<DeltaProcessor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trellis_httpd=info".parse().unwrap())
                .add_directive("trellis_indexer=info".parse().unwrap())
                .add_directive("tower_http=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!(
        config = %args.config_file,
        sparql = %args.sparql_endpoint,
        search = %args.search_url,
        listen = %args.listen,
        "Starting trellis"
    );

    let config = Arc::new(Configuration::from_file(&args.config_file)?);
    info!(
        types = config.definitions().len(),
        eager_groups = config.settings.eager_indexing_groups.len(),
        "Configuration loaded"
    );

    let pool = Arc::new(SparqlPool::for_endpoint(
        &args.sparql_endpoint,
        args.sparql_connections,
    ));
    let search: Arc<dyn SearchClient> = Arc::new(ElasticClient::new(&args.search_url));
    let extractor: Arc<dyn TextExtractor> = Arc::new(TikaExtractor::new(&args.tika_url));
    let documents = Arc::new(DocumentBuilder::new(
        &config.settings,
        extractor,
        AttachmentCache::new(&args.attachment_cache),
    ));

    let manager = IndexManager::new(Arc::clone(&config), pool, search, documents);

    // Reconcile persisted state and pre-build eager indexes before
    // accepting any traffic.
    manager.initialize().await;
    info!("Index initialization complete");

    let updates = UpdateHandler::new(Arc::clone(&manager));
    let deltas = DeltaProcessor::new(Arc::clone(&manager), Arc::clone(&updates));

    let state = Arc::new(AppState {
        manager,
        updates: Arc::clone(&updates),
        deltas: Arc::clone(&deltas),
    });

    let app = Router::new()
        .route("/update", post(handle_deltas))
        .route("/indexes/invalidate", post(handle_invalidate))
        .route("/indexes/update", post(handle_update))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(address = %args.listen, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued work before releasing the process.
    info!("Shutting down, draining queues");
    deltas.shutdown().await;
    updates.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not install shutdown handler");
    }
}

/// Ingest a delta notification.
async fn handle_deltas(
    State(state): State<Arc<AppState>>,
    Json(changesets): Json<Vec<DeltaChangeset>>,
) -> impl IntoResponse {
    state.deltas.submit(changesets);
    StatusCode::NO_CONTENT
}

/// Mark indexes stale so the next fetch rebuilds them.
async fn handle_invalidate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let type_name = params.get("type").map(String::as_str);
    let indexes = state.manager.invalidate_indexes(type_name).await;
    Json(json!({ "indexes": describe(&indexes) }))
}

/// Force a rebuild of the selected indexes.
async fn handle_update(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let type_name = params.get("type").map(String::as_str);
    let scope = params
        .get("allowed_groups")
        .and_then(|raw| AccessScope::from_json(raw).ok());
    let indexes = state
        .manager
        .fetch_indexes(type_name, scope.as_ref(), true)
        .await;
    Json(json!({ "indexes": describe(&indexes) }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "pending_updates": state.updates.pending(),
    }))
}

fn describe(indexes: &[Arc<SearchIndex>]) -> Vec<serde_json::Value> {
    indexes
        .iter()
        .map(|index| {
            json!({
                "name": index.name(),
                "type": index.type_name(),
                "status": format!("{:?}", index.status()).to_lowercase(),
                "eager": index.is_eager(),
            })
        })
        .collect()
}
