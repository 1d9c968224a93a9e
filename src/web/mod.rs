//! Dashboard and JSON API for on-demand and background polling

use crate::poll::{BackgroundPoller, PollOptions, Tunnel, poll_job};
use crate::settings::Settings;
use crate::umg::{Meter, UmgClient, latest_reading};
use crate::vpn::VpnConnection;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub mod page;

#[derive(Clone)]
pub struct AppState {
    pub tunnel: Arc<dyn Tunnel>,
    pub meter: Arc<dyn Meter>,
    pub exports_dir: PathBuf,
    pub poller: Arc<BackgroundPoller>,
    pub poll_defaults: PollOptions,
    pub refresh_s: u64,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> Self {
        let tunnel: Arc<dyn Tunnel> = Arc::new(VpnConnection::from_settings(settings));
        Self {
            tunnel,
            meter: Arc::new(UmgClient::from_settings(&settings.umg)),
            exports_dir: settings.exports_dir(),
            poller: Arc::new(BackgroundPoller::new()),
            poll_defaults: PollOptions::from_settings(&settings.poll),
            refresh_s: settings.dashboard.refresh_s,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartPollerRequest {
    pub interval_s: Option<u64>,
    pub cycles: Option<u32>,
    pub align_to_minute: Option<bool>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Run blocking work off the async runtime, mapping failures to a 500
async fn blocking<T, F>(work: F) -> Result<T, Response>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!("Request failed: {:#}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
        }
        Err(e) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn index(State(state): State<AppState>) -> Response {
    let tunnel = state.tunnel.clone();
    let meter = state.meter.clone();
    let exports_dir = state.exports_dir.clone();

    let vpn = tokio::task::spawn_blocking(move || tunnel.status()).await;
    let health = tokio::task::spawn_blocking(move || meter.health()).await;
    let latest = tokio::task::spawn_blocking(move || latest_reading(&exports_dir)).await;

    let vpn_error;
    let vpn = match &vpn {
        Ok(status) => Ok(status),
        Err(e) => {
            vpn_error = e.to_string();
            Err(vpn_error.as_str())
        }
    };
    let health_error;
    let health = match &health {
        Ok(health) => Ok(health),
        Err(e) => {
            health_error = e.to_string();
            Err(health_error.as_str())
        }
    };
    let latest = match latest {
        Ok(Ok(latest)) => latest,
        Ok(Err(e)) => {
            tracing::warn!("Could not read latest export: {:#}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Latest export task failed: {}", e);
            None
        }
    };
    let poller = state.poller.snapshot();

    Html(page::render(&page::PageData {
        vpn,
        health,
        latest: latest.as_ref(),
        poller: &poller,
        refresh_s: state.refresh_s,
    }))
    .into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    let tunnel = state.tunnel.clone();
    match blocking(move || Ok(tunnel.status())).await {
        Ok(status) => Json(status).into_response(),
        Err(response) => response,
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let meter = state.meter.clone();
    match blocking(move || Ok(meter.health())).await {
        Ok(health) => Json(health).into_response(),
        Err(response) => response,
    }
}

async fn run_poll(State(state): State<AppState>) -> Response {
    let job = poll_job(state.tunnel.clone(), state.meter.clone(), &state.exports_dir);
    match blocking(move || job(0.0)).await {
        Ok(payload) => Json(payload).into_response(),
        Err(response) => response,
    }
}

async fn latest(State(state): State<AppState>) -> Response {
    let exports_dir = state.exports_dir.clone();
    match blocking(move || latest_reading(&exports_dir)).await {
        Ok(Some(latest)) => Json(latest).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "No readings exported yet"),
        Err(response) => response,
    }
}

async fn poller_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.poller.snapshot())
}

/// An empty body selects the configured defaults; anything else must parse
fn parse_start_request(body: &[u8]) -> Result<StartPollerRequest, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StartPollerRequest::default());
    }
    serde_json::from_slice(body)
}

async fn start_poller(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_start_request(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Invalid poller options: {}", e),
            );
        }
    };
    let defaults = &state.poll_defaults;
    let options = PollOptions {
        interval: request
            .interval_s
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval),
        cycles: request.cycles,
        align_to_minute: request.align_to_minute.unwrap_or(defaults.align_to_minute),
    };

    if state.poller.is_running() {
        return error_response(StatusCode::CONFLICT, "Polling already running");
    }
    let job = poll_job(state.tunnel.clone(), state.meter.clone(), &state.exports_dir);
    match state.poller.start(options, job) {
        Ok(()) => Json(state.poller.snapshot()).into_response(),
        Err(e) if state.poller.is_running() => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

async fn stop_poller(State(state): State<AppState>) -> Response {
    let poller = state.poller.clone();
    match blocking(move || Ok(poller.stop())).await {
        Ok(stopped) => Json(serde_json::json!({ "stopped": stopped })).into_response(),
        Err(response) => response,
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/run", post(run_poll))
        .route("/latest", get(latest))
        .route("/poller", get(poller_state))
        .route("/poller/start", post(start_poller))
        .route("/poller/stop", post(stop_poller))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the dashboard until the process is stopped
pub async fn start_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let poller = state.poller.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    println!("✓ Dashboard listening on http://{}", listener.local_addr()?);
    tracing::info!("Dashboard listening on {}", bind);

    let result = axum::serve(listener, app).await;
    poller.stop();
    result?;
    Ok(())
}
