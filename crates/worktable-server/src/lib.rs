//! worktable HTTP server.
//!
//! Serves Workspace and Board collections from an in-memory document store:
//! mutations go through the [`MutationGateway`](worktable_client::MutationGateway),
//! lists and SSE watches through the shared
//! [`SubscriptionRegistry`](worktable_client::SubscriptionRegistry), so any
//! number of HTTP watchers of one query share a single store watch.

pub mod config;
pub mod constants;
pub mod routes;
pub mod state;

use std::future::Future;

use axum::Router;
use tokio::net::TcpListener;

pub use config::{Args, ConfigError, ServerConfig};
pub use routes::{ApiError, build_router};
pub use state::AppState;

/// The full application router.
pub fn app(state: AppState) -> Router {
    build_router(state)
}

/// Serve on `listener` until `shutdown` resolves, then shut the registry
/// down so open SSE watches terminate.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "worktable server listening");
    }
    let registry = state.registry.clone();
    let result = axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutdown requested, terminating watches");
            registry.shutdown();
        })
        .await;
    tracing::info!("worktable server stopped");
    result
}
