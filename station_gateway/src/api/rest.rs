use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing::{info, warn};

use crate::config::settings::ServerSettings;
use crate::dispatch::dispatcher::{EnqueueOutcome, TriggerDispatcher};
use crate::dispatch::message::{TriggerPriority, TriggerSource};
use crate::error::GatewayError;
use crate::orchestrator::CommunicationOrchestrator;
use crate::tags::structures::{DataType, Quality, ValueVariant};

#[derive(Clone)]
pub struct SharedAppState {
    pub orchestrator: Arc<CommunicationOrchestrator>,
    pub dispatcher: Arc<TriggerDispatcher>,
    pub start_time: tokio::time::Instant,
}

#[derive(Serialize)]
pub struct TagView {
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    pub driver_code: String,
    pub value: ValueVariant,
    pub quality: Quality,
    pub timestamp: u64,
}

#[derive(Deserialize)]
pub struct TriggerRequest {
    pub station_id: String,
    #[serde(default = "default_manual")]
    pub source: TriggerSource,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub priority: TriggerPriority,
    #[serde(default)]
    pub debounce_key: Option<String>,
}

fn default_manual() -> TriggerSource {
    TriggerSource::Manual
}

fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::InvalidValue(_) | GatewayError::NotSupported(_) | GatewayError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        GatewayError::Configuration(_) => StatusCode::CONFLICT,
        GatewayError::Connection(_)
        | GatewayError::Timeout(_)
        | GatewayError::Io(_)
        | GatewayError::Protocol { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Shutdown(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: GatewayError) -> (StatusCode, Json<serde_json::Value>) {
    (status_for(&error), Json(json!({ "error": error.to_string() })))
}

pub fn create_api_routes() -> Router<SharedAppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tags", get(list_tags))
        .route("/api/tags/:id", get(get_tag).put(write_tag))
        .route("/api/triggers", post(post_trigger))
        .route("/api/channels", get(list_channels))
        .route("/api/dispatcher/stats", get(dispatcher_stats))
}

/// Full router with state, behind basic auth when credentials are configured.
pub fn create_router(state: SharedAppState, server: &ServerSettings) -> Router {
    let router = create_api_routes().with_state(state);
    match (&server.username, &server.password) {
        (Some(user), Some(pass)) => router.layer(ValidateRequestHeaderLayer::basic(user, pass)),
        _ => router,
    }
}

async fn health(State(state): State<SharedAppState>) -> impl IntoResponse {
    let channels = state.orchestrator.channel_statuses().await;
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "tag_count": state.orchestrator.engine().len(),
        "channel_count": channels.len(),
        "connected_channels": channels.iter().filter(|c| c.connected).count(),
    }))
}

async fn list_tags(State(state): State<SharedAppState>) -> impl IntoResponse {
    let mut tags: Vec<TagView> = state
        .orchestrator
        .engine()
        .get_all_tags()
        .into_iter()
        .map(|(tag, snapshot)| TagView {
            name: tag.name,
            address: tag.address,
            data_type: tag.data_type,
            driver_code: tag.driver_code,
            value: snapshot.value,
            quality: snapshot.quality,
            timestamp: snapshot.timestamp,
        })
        .collect();
    tags.sort_by(|a, b| a.name.cmp(&b.name));
    Json(tags)
}

async fn get_tag(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.orchestrator.engine().read_tag(&id).is_none() {
        return error_response(GatewayError::NotFound(format!("tag '{}'", id)));
    }
    let snapshot = state.orchestrator.get_tag_value(&id);
    (StatusCode::OK, Json(json!({ "name": id, "snapshot": snapshot })))
}

async fn write_tag(
    State(state): State<SharedAppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let value = ValueVariant::from(body);
    match state.orchestrator.write_tag(&id, &value).await {
        Ok(()) => {
            info!(tag = %id, "Tag written via API");
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(e) => {
            warn!(tag = %id, error = %e, "API write failed");
            error_response(e)
        }
    }
}

async fn post_trigger(
    State(state): State<SharedAppState>,
    Json(request): Json<TriggerRequest>,
) -> impl IntoResponse {
    let outcome = state
        .dispatcher
        .enqueue(
            &request.station_id,
            request.source,
            request.payload,
            request.priority,
            request.debounce_key.as_deref(),
        )
        .await;
    match outcome {
        Ok(EnqueueOutcome::Accepted(trace_id)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "trace_id": trace_id })),
        ),
        Ok(EnqueueOutcome::Debounced) => (StatusCode::OK, Json(json!({ "status": "debounced" }))),
        Err(e) => error_response(e),
    }
}

async fn list_channels(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(state.orchestrator.channel_statuses().await)
}

async fn dispatcher_stats(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(state.dispatcher.stats())
}
