//! Local HTTP surface
//!
//! One axum router serves both the local TCP listener and the reverse
//! tunnel: the broker's requests are dispatched into the same router
//! in-process, so the agent never opens a port for the broker.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use pm_core::Metric;

use crate::check::Check;
use crate::store::MetricStore;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MetricStore>,
    pub check: Arc<Check>,
}

/// Build the agent's router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(run))
        .route("/run", get(run))
        .route("/inventory", get(inventory))
        .route("/write/{id}", put(write).post(write))
        .with_state(state)
}

/// Serve the router on the local listener until cancelled
pub async fn serve(listen: &str, router: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;
    tracing::info!("metrics listener on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving metrics listener")?;

    Ok(())
}

/// `GET /` and `GET /run`: full metrics snapshot
async fn run(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.store.snapshot().await;

    // new metric names must reach the broker-side catalog, but a control
    // API hiccup never fails a metrics request
    if let Err(e) = state.check.enable_new_metrics(&snapshot).await {
        tracing::warn!("enabling new metrics: {}", e);
    }

    Json(snapshot)
}

/// `GET /inventory`: sources that have written metrics
async fn inventory(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.inventory().await)
}

/// `PUT|POST /write/{id}`: merge pushed metrics into the store
async fn write(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<HashMap<String, Metric>>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(metrics)) => {
            tracing::debug!("accepted {} metrics for source {}", metrics.len(), id);
            state.store.write(&id, metrics).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(rejection) => {
            tracing::warn!("rejected metrics for source {}: {}", id, rejection.body_text());
            (StatusCode::BAD_REQUEST, rejection.body_text()).into_response()
        }
    }
}
