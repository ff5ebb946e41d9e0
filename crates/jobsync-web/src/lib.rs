//! Operator HTTP surface: trigger a sync run and read the latest report.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobsync_core::SyncReport;
use jobsync_sync::{latest_report, SyncConfig, SyncPipeline};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobsync-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(sync_handler))
        .route("/reports/latest", get(latest_report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, pipeline: Arc<SyncPipeline>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr.as_str())
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "operator endpoint listening");
    axum::serve(listener, app(AppState::new(pipeline)))
        .await
        .context("serving operator endpoint")?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_sync().await {
        Ok(report) => report_response(report),
        Err(err) => {
            error!(error = %err, "triggered sync failed");
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

async fn latest_report_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(root) = state.pipeline.reports_root().cloned() else {
        return error_response(StatusCode::NOT_FOUND, "report writing is disabled".to_string());
    };
    match tokio::task::spawn_blocking(move || latest_report(&root)).await {
        Ok(Ok(Some(report))) => report_response(report),
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, "no sync run recorded yet".to_string()),
        Ok(Err(err)) => server_error(err),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

fn report_response(report: SyncReport) -> Response {
    (StatusCode::OK, Json(report)).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}
