//! HTTP API server.
//!
//! Thin route handlers over the path resolver, downloader, and model gate.
//! Internal failures travel as result values and only become HTTP status
//! codes here.
//!
//! # Endpoints
//!
//! - `GET /` - Liveness and loaded flag
//! - `GET /health` - Loaded flag plus on-disk model state
//! - `GET|POST /load-model` - Lazy single-shot model load
//! - `GET|POST /generate` - Text completion
//! - `GET /model-status` - On-disk model details
//! - `GET /download-model` - SSE progress stream for model acquisition

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::download::{Downloader, ProgressEvent, DEFAULT_MODEL_URL};
use crate::engine::{InferenceEngine, LoadOptions};
use crate::gate::{self, InferError, LoadError, ModelGate};
use crate::paths::ModelLocation;

/// Port the desktop client connects to.
pub const DEFAULT_PORT: u16 = 55440;

/// Shared state for all handlers.
pub struct AppState {
    pub gate: ModelGate,
    pub downloader: Downloader,
    pub location: ModelLocation,
    pub model_url: String,
    pub load_options: LoadOptions,
}

/// API server configuration, builder style.
pub struct Server {
    location: ModelLocation,
    engine: Arc<dyn InferenceEngine>,
    port: u16,
    bind_address: String,
    model_url: String,
    load_options: LoadOptions,
}

impl Server {
    /// Create a server for the given model location and engine.
    ///
    /// Binds to all interfaces by default because the desktop client talks
    /// to the backend over loopback-or-LAN without configuration.
    pub fn new(location: ModelLocation, engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            location,
            engine,
            port: DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            model_url: DEFAULT_MODEL_URL.to_string(),
            load_options: LoadOptions::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_model_url(mut self, url: impl Into<String>) -> Self {
        self.model_url = url.into();
        self
    }

    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.load_options = options;
        self
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Result<Router> {
        let state = Arc::new(AppState {
            gate: ModelGate::new(self.engine.clone()),
            downloader: Downloader::new()?,
            location: self.location.clone(),
            model_url: self.model_url.clone(),
            load_options: self.load_options.clone(),
        });

        // The Electron client runs from a file:// origin, so CORS stays
        // wide open like the original desktop backend.
        Ok(Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/load-model", get(load_model_handler).post(load_model_handler))
            .route("/generate", get(generate_handler).post(generate_handler))
            .route("/model-status", get(model_status_handler))
            .route("/download-model", get(download_model_handler))
            .layer(CorsLayer::permissive())
            .with_state(state))
    }

    /// Start the server and run until interrupted.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router()?;
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("starting server on {}", addr);
        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "server is binding to 0.0.0.0, which exposes the API to the network; \
                use --bind 127.0.0.1 for local-only access"
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind to {addr}: {e}"))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Serialize)]
struct RootResponse {
    status: &'static str,
    model_loaded: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    model_exists: bool,
    model_path: String,
}

#[derive(Serialize)]
struct LoadResponse {
    success: bool,
    message: &'static str,
}

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_temperature")]
    temperature: f32,
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Serialize)]
struct GenerateResponse {
    success: bool,
    response: String,
}

#[derive(Serialize)]
struct ModelStatusResponse {
    exists: bool,
    loaded: bool,
    path: String,
    size_mb: f64,
}

/// Error leaving the process boundary: a status code plus a structured body.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(%message, "rejecting request");
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(%message, "resource missing");
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn root_handler(State(state): State<Arc<AppState>>) -> Json<RootResponse> {
    Json(RootResponse {
        status: "online",
        model_loaded: state.gate.is_loaded(),
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.gate.is_loaded(),
        model_exists: state.location.exists(),
        model_path: state.location.full_path.display().to_string(),
    })
}

async fn load_model_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LoadResponse>, ApiError> {
    let already_loaded = state.gate.is_loaded();

    state
        .gate
        .ensure_loaded(&state.location, &state.load_options)
        .await
        .map_err(|e| match e {
            LoadError::NotFound(_) => {
                ApiError::not_found("Model not found. Please download it first")
            }
            LoadError::Engine(detail) => ApiError::internal(detail),
        })?;

    Ok(Json(LoadResponse {
        success: true,
        message: if already_loaded {
            "Model already loaded"
        } else {
            "Model loaded"
        },
    }))
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let stop = gate::default_stop_sequences();
    let response = state
        .gate
        .infer(&request.prompt, request.max_tokens, request.temperature, &stop)
        .await
        .map_err(|e| match e {
            InferError::NotLoaded => {
                ApiError::bad_request("Model not loaded. Call /load-model first")
            }
            InferError::Engine(detail) => ApiError::internal(detail),
        })?;

    Ok(Json(GenerateResponse {
        success: true,
        response,
    }))
}

async fn model_status_handler(
    State(state): State<Arc<AppState>>,
) -> Json<ModelStatusResponse> {
    let size_mb = state
        .location
        .size_bytes()
        .map(|bytes| round2(bytes as f64 / 1024.0 / 1024.0))
        .unwrap_or(0.0);

    Json(ModelStatusResponse {
        exists: state.location.exists(),
        loaded: state.gate.is_loaded(),
        path: state.location.full_path.display().to_string(),
        size_mb,
    })
}

/// Stream download progress as server-sent events: one `data: <percent>`
/// line per progress event, or `data: error|<message>` on failure.
async fn download_model_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.downloader.acquire(&state.location, &state.model_url);

    let stream = events.map(|event| {
        let data = match event {
            ProgressEvent::Percent(p) => p.to_string(),
            ProgressEvent::Error(msg) => format!("error|{msg}"),
        };
        Ok(Event::default().data(data))
    });

    Sse::new(stream)
}

// =============================================================================
// Utilities
// =============================================================================

/// Round to two decimal places, matching the client's size display.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Graceful shutdown on SIGINT/SIGTERM (Ctrl+C only on non-Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("received Ctrl+C, shutting down");
    }
}
