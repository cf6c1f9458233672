pub mod api;
pub mod state;

use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use steward_config::GatewayConfig;
use tracing::info;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(api::chat))
        .route("/api/history", get(api::history))
        .route("/api/tools/pending", get(api::pending_tools))
        .route("/api/tools/approve/{id}", post(api::approve_tool))
        .route("/api/tools/reject/{id}", post(api::reject_tool))
        .route("/api/tasks", post(api::start_task))
        .route("/api/tasks/{id}", get(api::task_status))
        .route("/api/tasks/{id}/stop", post(api::stop_task))
        .route("/api/tasks/{id}/resume", post(api::resume_task))
        .with_state(state)
}

/// Serve the API until the process is interrupted.
pub async fn serve(state: AppState, config: &GatewayConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid gateway listen address: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Steward API listening on http://{addr}");

    let recovered = recover_runs(&state).await?;
    if recovered > 0 {
        info!("Resumed {recovered} in-progress task run(s)");
    }

    let tasks = state.tasks.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    if let Some(tasks) = tasks {
        tasks.shutdown().await;
    }
    Ok(())
}

/// Restart every run a previous process left `in_progress`. Runs still
/// leased by another live process are skipped by the lease check.
pub async fn recover_runs(state: &AppState) -> Result<usize> {
    let Some(tasks) = &state.tasks else {
        return Ok(0);
    };
    let ids = tasks.recover(state.store.as_ref()).await?;
    Ok(ids.len())
}
