use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::FutureExt;
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::storage::MessageStore;
use crate::types::{HealthResponse, IngestResponse, Message, ServerInfo, StatusResponse};

/// Upper bound on handling a single ingest request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state behind the ingest router.
pub struct IngestState {
    store: Option<Arc<dyn MessageStore>>,
    routes: HashMap<String, String>,
    config: Arc<Config>,
}

impl IngestState {
    pub fn new(config: Arc<Config>, store: Option<Arc<dyn MessageStore>>) -> Self {
        let routes = config
            .routes
            .iter()
            .map(|route| (route.path.clone(), route.queue.clone()))
            .collect();
        Self {
            store,
            routes,
            config,
        }
    }
}

/// Build the ingest router: one POST route per configured webhook path,
/// plus liveness and configuration snapshots. Requests pass through a
/// deadline, a panic guard and access logging, in that order from the
/// handler outward.
pub fn router(state: Arc<IngestState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status));

    for route in &state.config.routes {
        info!(path = %route.path, queue = %route.queue, "registered webhook route");
        router = router.route(&route.path, post(ingest));
    }

    router
        .layer(middleware::from_fn(deadline))
        .layer(middleware::from_fn(recover))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn ingest(State(state): State<Arc<IngestState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();

    let Some(queue) = state.routes.get(&path).cloned() else {
        debug!(path = %path, "no queue configured for path");
        return (StatusCode::NOT_FOUND, "path not configured").into_response();
    };

    let id = match generate_message_id() {
        Ok(id) => id,
        Err(err) => {
            error!(error = %err, "failed to generate message id");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to generate message id",
            )
                .into_response();
        }
    };

    let headers = single_valued(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            warn!(message_id = %id, error = %err, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let Some(store) = &state.store else {
        error!(message_id = %id, "storage is not configured, rejecting webhook");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to process webhook",
        )
            .into_response();
    };

    let msg = Message::new(id.clone(), path, queue, body.to_vec(), headers);
    if let Err(err) = store.save(&msg).await {
        error!(message_id = %id, error = %err, "failed to persist webhook");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to process webhook",
        )
            .into_response();
    }

    info!(message_id = %id, queue = %msg.queue, "webhook accepted");
    (
        StatusCode::OK,
        Json(IngestResponse {
            message_id: id,
            status: "accepted".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }),
    )
        .into_response()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn status(State(state): State<Arc<IngestState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "running".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        routes: state.config.routes.clone(),
        server: ServerInfo {
            host: state.config.server.host.clone(),
            port: state.config.server.port,
        },
    })
}

/// 16 bytes of OS entropy, hex-encoded to 32 digits.
fn generate_message_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| BridgeError::Internal(format!("failed to draw entropy: {err}")))?;
    Ok(hex::encode(bytes))
}

/// Collapse the header map to one value per name, first value wins.
fn single_valued(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

async fn log_requests(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let remote = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        remote = %remote,
        "request handled"
    );
    response
}

/// Convert a panicking handler into a 500 without taking the process down.
async fn recover(request: Request, next: Next) -> Response {
    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            error!(panic = %panic_detail(panic.as_ref()), "request handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn deadline(request: Request, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response(),
    }
}
