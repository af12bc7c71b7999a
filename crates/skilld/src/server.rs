//! HTTP surface for the message bus.
//!
//! Local-only. `POST /bus/{event}` publishes, `GET /bus/events` streams every
//! bus message as SSE, and `GET /status` / `GET /skills` expose read-only views.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skill_core::messages::SkillListPayload;
use skill_core::types::{PassReport, SchedulerSnapshot};
use skill_core::Message;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::commands::build_skill_list;
use crate::registry::DirectoryLoader;
use crate::scheduler::Scheduler;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub bus: Arc<MessageBus>,
    pub scheduler: Arc<Scheduler>,
    pub loader: Arc<DirectoryLoader>,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("auth", &self.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/bus/events", get(stream_bus))
        .route("/bus/{event}", post(publish))
        .route("/status", get(get_status))
        .route("/skills", get(list_skills))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Start the HTTP server on 127.0.0.1.
pub async fn start_server(state: Arc<AppState>, port: u16) -> std::io::Result<()> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(error_response(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response for POST /bus/{event}.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub event: String,
    /// Subscribers that received the message.
    pub delivered: usize,
}

/// Response for GET /status.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub scheduler: SchedulerSnapshot,
    pub last_pass: Option<PassReport>,
}

/// Query params for GET /bus/events.
#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    /// Only forward messages whose type starts with this prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /bus/{event} - publish a message.
///
/// The body is the message data; an empty body publishes `null` data. A body
/// of the form `{"data": ..., "context": {...}}` sets both fields.
async fn publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(event): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    if event.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "event name is empty"));
    }

    let msg = if body.iter().all(u8::is_ascii_whitespace) {
        Message::new(event.clone(), Value::Null)
    } else {
        let value: Value = serde_json::from_slice(&body).map_err(|e| {
            warn!(event = %event, error = %e, "rejected malformed bus body");
            error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}"))
        })?;
        envelope(event.clone(), value)
    };

    let delivered = state.bus.emit(msg);
    debug!(event = %event, delivered, "published from http");
    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse { event, delivered }),
    ))
}

/// Split an explicit `{data, context}` envelope, or treat the body as data.
fn envelope(event: String, value: Value) -> Message {
    match value {
        Value::Object(mut map)
            if map.contains_key("context")
                && map.keys().all(|k| k == "data" || k == "context") =>
        {
            let context = match map.remove("context") {
                Some(Value::Object(context)) => context,
                _ => serde_json::Map::new(),
            };
            let mut msg = Message::new(event, map.remove("data").unwrap_or(Value::Null));
            msg.context = context;
            msg
        }
        other => Message::new(event, other),
    }
}

/// GET /bus/events - stream bus messages as SSE.
async fn stream_bus(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)>
{
    check_auth(&state, &headers)?;

    let rx = state.bus.subscribe();
    let prefix = query.prefix.unwrap_or_default();

    let stream = stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
        loop {
            match rx.recv().await {
                Ok(msg) if msg.msg_type.starts_with(&prefix) => {
                    let json = msg.to_json().unwrap_or_default();
                    let event = SseEvent::default().event(&msg.msg_type).data(json);
                    return Some((Ok(event), (rx, prefix)));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /status - scheduler snapshot and the last pass report.
async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    Ok(Json(StatusResponse {
        scheduler: state.scheduler.snapshot(),
        last_pass: state.scheduler.last_report(),
    }))
}

/// GET /skills - the same view `skillmanager.list` emits.
async fn list_skills(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SkillListPayload>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    Ok(Json(build_skill_list(&state.scheduler, &state.loader)))
}
