//! Diagnostics HTTP server: Prometheus metrics, a runtime profile snapshot
//! and a liveness endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::HttpConfig;
use crate::controllers::ClaimTracker;
use crate::error::{OperatorError, Result};
use crate::metrics::ControllerMetrics;

const HEALTH_PATH: &str = "/healthz";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct DiagnosticsState {
    pub metrics: Arc<ControllerMetrics>,
    pub tracker: Arc<ClaimTracker>,
    pub started_at: DateTime<Utc>,
    pub workers: u16,
    pub args: Vec<String>,
}

impl DiagnosticsState {
    pub fn new(metrics: Arc<ControllerMetrics>, tracker: Arc<ClaimTracker>, workers: u16) -> Self {
        Self {
            metrics,
            tracker,
            started_at: Utc::now(),
            workers,
            args: std::env::args().collect(),
        }
    }
}

/// Clean an HTTP path into rooted form: `metrics/` → `/metrics`,
/// `//a/./b/../c` → `/a/c`. Empty stays empty, meaning disabled.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

fn join_path(base: &str, child: &str) -> String {
    normalize_path(&format!("{}/{}", base, child))
}

/// Build the diagnostics router. Empty paths disable their endpoint.
pub fn router(http: &HttpConfig, state: DiagnosticsState) -> Result<Router> {
    let metrics_path = normalize_path(&http.metrics_path);
    let profile_path = normalize_path(&http.profile_path);

    let mut taken = vec![HEALTH_PATH.to_string()];
    let mut claim = |path: String| -> Result<String> {
        if taken.contains(&path) {
            return Err(OperatorError::Configuration(format!(
                "diagnostics path {} is used twice",
                path
            )));
        }
        taken.push(path.clone());
        Ok(path)
    };

    let mut router = Router::new().route(HEALTH_PATH, get(healthz));
    if !metrics_path.is_empty() {
        router = router.route(&claim(metrics_path)?, get(metrics));
    }
    if !profile_path.is_empty() {
        let cmdline_path = join_path(&profile_path, "cmdline");
        router = router
            .route(&claim(profile_path)?, get(profile))
            .route(&claim(cmdline_path)?, get(cmdline));
    }
    Ok(router.with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<DiagnosticsState>) -> Response {
    let body = state.metrics.to_prometheus(&state.tracker.counts());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

async fn profile(State(state): State<DiagnosticsState>) -> Response {
    let now = Utc::now();
    let claims: serde_json::Map<String, serde_json::Value> = state
        .tracker
        .counts()
        .into_iter()
        .map(|(s, n)| (s.to_string(), serde_json::Value::from(n)))
        .collect();
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at.to_rfc3339(),
        "uptimeSeconds": (now - state.started_at).num_seconds(),
        "workers": state.workers,
        "claims": claims,
    }))
    .into_response()
}

async fn cmdline(State(state): State<DiagnosticsState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.args.join("\0"),
    )
        .into_response()
}

/// `:8080` listens on every interface.
fn listen_address(endpoint: &str) -> String {
    if endpoint.starts_with(':') {
        format!("0.0.0.0{}", endpoint)
    } else {
        endpoint.to_string()
    }
}

/// Serve diagnostics until `cancel` fires.
pub async fn serve(endpoint: &str, router: Router, cancel: CancellationToken) -> Result<()> {
    let address = listen_address(endpoint);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| OperatorError::Http(format!("listen on {}: {}", address, e)))?;
    info!(address = %address, "Diagnostics server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| OperatorError::Http(format!("diagnostics server: {}", e)))
}
