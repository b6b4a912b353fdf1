//! ScenarioSync web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - Health endpoint
//! - Scenario lifecycle, entity editing, comparison, export and import
//! - Merge, retry and abandon of scenario branches
//! - Conflict listing and resolution
//! - Git sync (clone, pull, push, resume)
//! - Change history queries
//!
//! The caller is identified by the `x-user-id` header.

pub mod api;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method};
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use scenariosync_core::config::AppConfig;
use scenariosync_core::db::Database;
use scenariosync_core::{
    ChangeHistoryLog, ConflictResolver, DiffEngine, EntityStore, MergeCoordinator,
    ScenarioExporter, ScenarioGraph, SyncOrchestrator,
};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub graph: ScenarioGraph,
    pub store: EntityStore,
    pub diff: DiffEngine,
    pub merges: MergeCoordinator,
    pub resolver: ConflictResolver,
    pub history: ChangeHistoryLog,
    pub exporter: ScenarioExporter,
    pub sync: Arc<SyncOrchestrator>,
}

impl AppState {
    /// Wire every service onto one database.
    pub fn new(config: AppConfig, db: Arc<Database>, sync: Arc<SyncOrchestrator>) -> Self {
        let depth = config.merge.max_hierarchy_depth;
        Self {
            graph: ScenarioGraph::new(Arc::clone(&db), depth, &config.git.default_branch),
            store: EntityStore::new(Arc::clone(&db), depth),
            diff: DiffEngine::new(Arc::clone(&db), depth),
            merges: MergeCoordinator::new(
                Arc::clone(&db),
                config.merge.lock_stale_after_secs,
                depth,
            ),
            resolver: ConflictResolver::new(Arc::clone(&db)),
            history: ChangeHistoryLog::new(Arc::clone(&db)),
            exporter: ScenarioExporter::new(db, depth),
            sync,
            config,
        }
    }
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// The full API router with middleware applied.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(api::USER_HEADER)]);

        Router::new()
            .merge(api::status::routes())
            .merge(api::scenarios::routes())
            .merge(api::merges::routes())
            .merge(api::conflicts::routes())
            .merge(api::sync::routes())
            .merge(api::history::routes())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors)
                    // Import payloads carry whole scenarios.
                    .layer(DefaultBodyLimit::max(16 * 1024 * 1024)),
            )
            .with_state(Arc::clone(&self.state))
    }

    /// Start the web server, listening on the given address until `shutdown`
    /// resolves.
    pub async fn start<F>(self, listen_addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listen_addr.parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %listener.local_addr()?, "starting web server");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("web server stopped");
        Ok(())
    }
}
