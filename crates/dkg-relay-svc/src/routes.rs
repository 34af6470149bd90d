//! HTTP routes
//!
//! Thin adapters from the relay's HTTP surface onto [`Relay`].

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use dkg_relay::{OperatorId, Relay, RelayError, RunResult, TopicView};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Application state
pub struct AppState {
    pub relay: Relay,
    pub metrics: PrometheusHandle,
}

/// Build the service router
pub fn router(relay: Relay, metrics: PrometheusHandle) -> Router {
    let state = Arc::new(AppState { relay, metrics });

    Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(render_metrics))
        .route("/topics", get(list_topics).post(create_topic))
        .route("/topics/:topic_name", get(get_topic).delete(delete_topic))
        .route("/register_node", post(register_node))
        .route("/nodes/:name", delete(unregister_node))
        .route("/publish", post(publish))
        .route("/stream/dkgoutput", post(stream_dkg_output))
        .route("/stream/dkgblame", post(stream_dkg_blame))
        .route("/data/:request_id", get(get_data))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body shared by every endpoint
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, error: impl ToString) -> Self {
        Self {
            status,
            message: message.into(),
            error: error.to_string(),
        }
    }

    fn bad_request(message: impl Into<String>, error: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "message": self.message,
                "error": self.error,
            })),
        )
            .into_response()
    }
}

fn status_for(e: &RelayError) -> StatusCode {
    match e {
        RelayError::TopicNotFound(_) | RelayError::SubscriberNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::InvalidRequest(_) | RelayError::Decode(_) => StatusCode::BAD_REQUEST,
        RelayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Delivery(_) | RelayError::RetriesExhausted { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request("failed to parse request body", e))
}

fn require_request_id(request_id: Option<String>) -> Result<String, ApiError> {
    match request_id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(ApiError::bad_request(
            "empty requestID in the http request",
            "query parameter `request_id` not found in the request",
        )),
    }
}

async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "pong" }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "dkg-relay-svc",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Body of `POST /topics`
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTopicRequest {
    pub topic_name: String,
    pub subscribers: Vec<String>,
}

async fn list_topics(State(state): State<Arc<AppState>>) -> Json<Vec<TopicView>> {
    Json(state.relay.topics().await)
}

async fn create_topic(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TopicView>, ApiError> {
    let req: CreateTopicRequest = parse_body(&body)?;
    state
        .relay
        .create_topic(&req.topic_name, &req.subscribers)
        .await
        .map(Json)
        .map_err(|e| {
            error!(topic = %req.topic_name, error = %e, "failed to create topic");
            ApiError::new(status_for(&e), "failed to create topic", e)
        })
}

async fn get_topic(
    State(state): State<Arc<AppState>>,
    Path(topic_name): Path<String>,
) -> Result<Json<TopicView>, ApiError> {
    state
        .relay
        .topic(&topic_name)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(status_for(&e), format!("topic {topic_name} doesn't exist"), e))
}

async fn delete_topic(
    State(state): State<Arc<AppState>>,
    Path(topic_name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .relay
        .delete_topic(&topic_name)
        .await
        .map(|()| StatusCode::OK)
        .map_err(|e| ApiError::new(status_for(&e), "failed to delete topic", e))
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    subscribes_to: Option<String>,
}

/// Body of `POST /register_node`
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub name: String,
    pub srv_addr: String,
}

async fn register_node(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RegisterParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = params
        .subscribes_to
        .unwrap_or_else(|| state.relay.config().default_topic.clone());

    if let Err(e) = state.relay.topic(&topic).await {
        warn!(topic = %topic, "registration for unknown topic");
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("topic {topic} doesn't exist"),
            e,
        ));
    }

    let req: RegisterNodeRequest = parse_body(&body).map_err(|e| ApiError {
        message: "failed to parse subscriber data from the request body".to_string(),
        ..e
    })?;

    let status = state
        .relay
        .register_node(&topic, &req.name, &req.srv_addr)
        .await
        .map_err(|e| {
            error!(topic = %topic, subscriber = %req.name, error = %e, "registration failed");
            ApiError::new(status_for(&e), "invalid subscriber data", e)
        })?;

    Ok(Json(serde_json::json!({ "status": status })))
}

async fn unregister_node(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.relay.unregister_node(&name).await {
        Ok(Json(serde_json::json!({ "removed": true })))
    } else {
        let e = RelayError::SubscriberNotFound(name);
        Err(ApiError::new(StatusCode::NOT_FOUND, "unknown subscriber", e))
    }
}

#[derive(Debug, Deserialize)]
struct PublishParams {
    topic_name: Option<String>,
}

async fn publish(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PublishParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let topic = params.topic_name.unwrap_or_default();

    match state.relay.publish(&topic, body.to_vec()).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "message": format!("message successfully published to topic {topic}"),
            "error": null,
        }))),
        Err(e) => {
            error!(topic = %topic, error = %e, "publish failed");
            let status = match e {
                RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(ApiError::new(
                status,
                format!("failed to publish data to topic {topic}"),
                e,
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    request_id: Option<String>,
}

async fn stream_dkg_output(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request_id = require_request_id(params.request_id)?;
    let outputs: BTreeMap<OperatorId, serde_json::Value> = parse_body(&body)?;

    info!(request_id = %request_id, operators = outputs.len(), "dkg output received");
    state
        .relay
        .put_result(&request_id, RunResult::DkgOutputs(outputs));
    Ok(StatusCode::OK)
}

async fn stream_dkg_blame(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let request_id = require_request_id(params.request_id)?;
    let blame: serde_json::Value = parse_body(&body)?;
    if !blame.is_object() {
        return Err(ApiError::bad_request(
            "failed to parse request body",
            "blame output must be a JSON object",
        ));
    }

    info!(request_id = %request_id, "dkg blame received");
    state
        .relay
        .put_result(&request_id, RunResult::BlameOutput(blame));
    Ok(StatusCode::OK)
}

async fn get_data(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Response {
    match state.relay.get_result(&request_id) {
        Some(stored) => Json(stored.result).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
