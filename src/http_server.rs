use crate::error::ApiError;
use crate::hub::BroadcastHub;
use crate::localtime;
use crate::pipeline::{self, Acknowledgement, IngestionPipeline};
use crate::replay::Replayer;
use crate::store::WebhookStore;
use crate::types::DeliveryFilter;
use crate::verification;
use crate::ws;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{Extensions, HeaderMap, HeaderValue},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;
const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<IngestionPipeline>,
    pub store: Arc<WebhookStore>,
    pub hub: Arc<BroadcastHub>,
    pub replayer: Arc<Replayer>,
    pub timezone: Tz,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(pipeline: Arc<IngestionPipeline>, replayer: Replayer) -> Self {
        Self {
            store: pipeline.store().clone(),
            hub: pipeline.hub().clone(),
            timezone: pipeline.timezone(),
            pipeline,
            replayer: Arc::new(replayer),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .route("/genuka/webhook", post(receive_webhook))
        .route("/api/webhooks", get(list_webhooks))
        .route("/api/webhooks/search", post(search_webhooks))
        .route("/api/webhooks/test", post(send_test_webhook))
        .route("/api/test", post(send_test_webhook))
        .route("/api/webhooks/{id}", get(get_webhook))
        .route("/api/webhooks/{id}/replay", post(replay_webhook))
        .route("/api/stats", get(stats))
        .route("/api/signature/validate", post(validate_signature))
        .route("/api/signature/generate", post(generate_signature))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .fallback(route_not_found)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: CancellationToken) -> std::io::Result<()> {
    let app = build_router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn socket_ip(extensions: &Extensions) -> Option<String> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
    pipeline::client_ip_from(headers, socket_ip(extensions))
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

async fn receive_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Acknowledgement {
    state.pipeline.ingest(&headers, body, socket_ip(&extensions))
}

#[derive(Debug, Default, Deserialize)]
struct TestWebhookRequest {
    event_type: Option<String>,
    company_id: Option<String>,
    payload: Option<Value>,
    generate_signature: Option<bool>,
    secret: Option<String>,
}

/// Synthesize a delivery and push it through the regular pipeline.
async fn send_test_webhook(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: TestWebhookRequest = if body.is_empty() {
        TestWebhookRequest::default()
    } else {
        parse_json(&body)?
    };

    let event_type = req.event_type.unwrap_or_else(|| "order.created".to_string());
    let company_id = req.company_id.unwrap_or_else(|| "test_company".to_string());
    let now = Utc::now();

    let mut payload = match req.payload {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ApiError::BadRequest("payload must be a JSON object".into())),
        None => {
            let sample = json!({
                "data": {
                    "id": format!("test_{}", &Uuid::new_v4().simple().to_string()[..8]),
                    "test": true,
                    "created_at": now.to_rfc3339(),
                }
            });
            sample.as_object().cloned().unwrap_or_default()
        }
    };
    payload.entry("event").or_insert_with(|| json!(event_type));
    payload.entry("company_id").or_insert_with(|| json!(company_id));
    payload.entry("timestamp").or_insert_with(|| json!(now.to_rfc3339()));
    let raw = Value::Object(payload).to_string();

    let delivery_id = format!("test_{}", Uuid::new_v4());
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static("webhook-inspector-test"));
    headers.insert("x-genuka-delivery", header_value(&delivery_id)?);
    headers.insert("x-genuka-event", header_value(&event_type)?);
    headers.insert("x-genuka-company", header_value(&company_id)?);

    let secret = req.secret.or_else(|| state.pipeline.secret().map(str::to_string));
    let signature = match (req.generate_signature.unwrap_or(true), secret) {
        (true, Some(secret)) => Some(verification::generate(raw.as_bytes(), &secret)),
        _ => None,
    };
    if let Some(sig) = &signature {
        headers.insert("x-signature", header_value(sig)?);
    }

    let ack = state.pipeline.ingest(&headers, Bytes::from(raw.clone()), Some("127.0.0.1".into()));
    let status = ack.status;
    let body = json!({
        "success": ack.body.success,
        "test": true,
        "payload": serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null),
        "signature": signature,
        "result": ack.body,
    });
    Ok((status, Json(body)))
}

// ─── Query API ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    event_type: Option<String>,
    company_id: Option<String>,
    is_valid_signature: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    search: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    page: Option<String>,
}

impl ListQuery {
    fn filter(&self, tz: Tz) -> Result<DeliveryFilter, ApiError> {
        let is_valid_signature = match non_empty(&self.is_valid_signature) {
            None => None,
            Some("true" | "1") => Some(true),
            Some("false" | "0") => Some(false),
            Some(other) => {
                return Err(ApiError::BadRequest(format!("invalid is_valid_signature: {other}")));
            }
        };
        let date = |raw: &Option<String>, end_of_day: bool| -> Result<_, ApiError> {
            non_empty(raw)
                .map(|r| {
                    localtime::parse_date_bound(r, tz, end_of_day)
                        .ok_or_else(|| ApiError::BadRequest(format!("invalid date: {r}")))
                })
                .transpose()
        };
        Ok(DeliveryFilter {
            event_type: non_empty(&self.event_type).map(str::to_string),
            company_id: non_empty(&self.company_id).map(str::to_string),
            is_valid_signature,
            date_from: date(&self.date_from, false)?,
            date_to: date(&self.date_to, true)?,
            search: non_empty(&self.search).map(str::to_string),
        })
    }

    fn window(&self) -> Result<(usize, usize), ApiError> {
        let limit = parse_count(&self.limit, "limit")?
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = match parse_count(&self.page, "page")? {
            Some(page) => page.saturating_sub(1).saturating_mul(limit),
            None => parse_count(&self.offset, "offset")?.unwrap_or(0),
        };
        Ok((limit, offset))
    }
}

async fn list_webhooks(
    State(state): State<ServerState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = query.filter(state.timezone)?;
    let (limit, offset) = query.window()?;
    let page = state.store.list(&filter, limit, offset).await;

    let now = Utc::now();
    let data: Vec<_> = page.items.iter().map(|d| d.view(state.timezone, now)).collect();
    Ok(Json(json!({
        "success": true,
        "data": data,
        "pagination": page.pagination(),
    })))
}

async fn get_webhook(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let delivery = state.store.get(&id).await?;
    Ok(Json(json!({
        "success": true,
        "data": delivery.view(state.timezone, Utc::now()),
    })))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: String,
    limit: Option<usize>,
}

async fn search_webhooks(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: SearchRequest = parse_json(&body)?;
    let query = req.query.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("query is required".into()));
    }
    let limit = req.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_PAGE_SIZE);
    let now = Utc::now();
    let data: Vec<_> = state
        .store
        .search(query, limit)
        .await
        .iter()
        .map(|d| d.view(state.timezone, now))
        .collect();
    Ok(Json(json!({
        "success": true,
        "count": data.len(),
        "data": data,
    })))
}

async fn stats(State(state): State<ServerState>) -> Json<Value> {
    let now = Utc::now();
    let webhooks = state.store.stats(state.timezone, now).await;
    let websocket = state.hub.stats().await;
    Json(json!({
        "success": true,
        "data": webhooks,
        "websocket": websocket,
        "server": {
            "timezone": state.timezone.name(),
            "local_time": localtime::to_local(now, state.timezone).to_rfc3339(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "in_flight": state.pipeline.in_flight().len(),
        },
    }))
}

// ─── Replay ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReplayRequest {
    target_url: Option<String>,
}

async fn replay_webhook(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: ReplayRequest = parse_json(&body)?;
    let target_url = req
        .target_url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("target_url is required".into()))?;

    let delivery = state.store.get(&id).await?;
    let outcome = state.replayer.replay(&delivery, target_url.trim()).await.map_err(|e| {
        tracing::warn!(webhook_id = %id, target = %target_url, error = %e, "replay failed");
        ApiError::from(e)
    })?;

    Ok(Json(json!({
        "success": true,
        "message": "Webhook replayed",
        "replay": outcome,
    })))
}

// ─── Signature tooling ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SignatureRequest {
    payload: Option<Value>,
    signature: Option<String>,
    secret: Option<String>,
}

impl SignatureRequest {
    fn payload_text(&self) -> Result<String, ApiError> {
        match &self.payload {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(ApiError::BadRequest("payload is required".into())),
        }
    }
}

async fn validate_signature(body: Bytes) -> Result<Json<Value>, ApiError> {
    let req: SignatureRequest = parse_json(&body)?;
    let payload = req.payload_text()?;
    let signature = req
        .signature
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("signature is required".into()))?;

    let result = verification::verify(payload.as_bytes(), Some(signature), req.secret.as_deref());
    Ok(Json(json!({
        "success": true,
        "validation": {
            "is_valid": result.is_ok(),
            "format_valid": verification::is_valid_format(signature),
            "error": result.err().map(|e| e.to_string()),
        },
    })))
}

async fn generate_signature(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let req: SignatureRequest = parse_json(&body)?;
    let payload = req.payload_text()?;
    let secret = req
        .secret
        .filter(|s| !s.is_empty())
        .or_else(|| state.pipeline.secret().map(str::to_string))
        .ok_or_else(|| ApiError::BadRequest("secret is required".into()))?;

    Ok(Json(json!({
        "success": true,
        "signature": verification::generate(payload.as_bytes(), &secret),
    })))
}

// ─── Misc ────────────────────────────────────────────────────────────────────

async fn health(State(state): State<ServerState>) -> Json<Value> {
    let now = Utc::now();
    Json(json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION"),
        "timezone": state.timezone.name(),
        "timestamp": now.to_rfc3339(),
        "local_time": localtime::to_local(now, state.timezone).to_rfc3339(),
    }))
}

async fn route_not_found() -> ApiError {
    ApiError::NotFound("route not found".into())
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn header_value(raw: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid header value: {raw}")))
}

fn non_empty(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_count(raw: &Option<String>, name: &str) -> Result<Option<usize>, ApiError> {
    non_empty(raw)
        .map(|r| {
            r.parse::<usize>()
                .map_err(|_| ApiError::BadRequest(format!("invalid {name}: {r}")))
        })
        .transpose()
}
