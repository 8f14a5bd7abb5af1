//! Per-delivery orchestration.
//!
//! Everything that can change the HTTP response (dedup, signature, parsing,
//! classification) runs before the acknowledgement. Persistence, broadcast
//! and business hooks run afterwards on a tracked task so shutdown can wait
//! for them.

use crate::classify::{
    classify_event, detect_mobile_money_provider, extract_tenant_id, INVALID_PAYLOAD_EVENT,
};
use crate::dedup::DeliveryDeduplicator;
use crate::error::StoreError;
use crate::hooks::HookRegistry;
use crate::hub::BroadcastHub;
use crate::store::WebhookStore;
use crate::types::Delivery;
use crate::verification;
use axum::{
    body::Bytes,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

const DELIVERY_ID_HEADERS: [&str; 2] = ["x-genuka-delivery", "x-delivery-id"];
const SIGNATURE_HEADERS: [&str; 5] = [
    "x-signature",
    "x-hub-signature-256",
    "x-genuka-signature",
    "x-webhook-signature",
    "signature",
];

pub struct PipelineSettings {
    pub secret: Option<String>,
    pub strict_mode: bool,
    pub timezone: Tz,
    pub dedup_capacity: usize,
}

/// Response to the sender. Built before any storage or fan-out happens.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    pub status: StatusCode,
    pub body: AckBody,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AckBody {
    pub received: bool,
    pub success: bool,
    pub delivery_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_valid_signature: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_provider: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub message: String,
}

impl IntoResponse for Acknowledgement {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub struct IngestionPipeline {
    store: Arc<WebhookStore>,
    hub: Arc<BroadcastHub>,
    hooks: HookRegistry,
    dedup: DeliveryDeduplicator,
    secret: Option<String>,
    strict_mode: bool,
    timezone: Tz,
    tracker: TaskTracker,
    in_flight: Mutex<HashSet<String>>,
}

impl IngestionPipeline {
    pub fn new(
        settings: PipelineSettings,
        store: Arc<WebhookStore>,
        hub: Arc<BroadcastHub>,
        hooks: HookRegistry,
    ) -> Self {
        if settings.secret.is_none() {
            tracing::warn!("no webhook secret configured, every delivery will be accepted as valid");
        }
        Self {
            store,
            hub,
            hooks,
            dedup: DeliveryDeduplicator::new(settings.dedup_capacity),
            secret: settings.secret,
            strict_mode: settings.strict_mode,
            timezone: settings.timezone,
            tracker: TaskTracker::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<WebhookStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Validate and acknowledge one delivery, then hand the rest of its
    /// processing to a tracked background task.
    pub fn ingest(self: &Arc<Self>, headers: &HeaderMap, body: Bytes, socket_ip: Option<String>) -> Acknowledgement {
        let start = Instant::now();
        let received_at = Utc::now();

        let delivery_id = DELIVERY_ID_HEADERS
            .iter()
            .find_map(|h| header_str(headers, h))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.dedup.seen_before(&delivery_id) {
            return duplicate_ack(delivery_id, start);
        }

        let signature = SIGNATURE_HEADERS
            .iter()
            .find_map(|h| header_str(headers, h))
            .map(str::to_string);
        let (is_valid_signature, signature_error) = self.check_signature(&body, signature.as_deref(), &delivery_id);

        if self.strict_mode && !is_valid_signature {
            tracing::warn!(delivery_id = %delivery_id, "rejecting delivery with invalid signature");
            return Acknowledgement {
                status: StatusCode::UNAUTHORIZED,
                body: AckBody {
                    received: false,
                    success: false,
                    delivery_id,
                    is_valid_signature: Some(false),
                    signature_error: signature_error.clone(),
                    code: Some("INVALID_SIGNATURE"),
                    error: signature_error,
                    processing_time_ms: elapsed_ms(start),
                    message: "Invalid signature".into(),
                    ..Default::default()
                },
            };
        }

        let parsed = serde_json::from_slice::<Value>(&body).ok().filter(Value::is_object);
        let (event_type, company_id, mobile_provider) = match &parsed {
            Some(payload) => (
                classify_event(payload, headers),
                extract_tenant_id(payload, headers),
                detect_mobile_money_provider(payload),
            ),
            None => (
                INVALID_PAYLOAD_EVENT.to_string(),
                extract_tenant_id(&Value::Null, headers),
                None,
            ),
        };

        let processing_time_ms = elapsed_ms(start);
        let (payload_text, payload_base64) = Delivery::capture_body(&body);
        let delivery = Delivery {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.clone(),
            event_type: event_type.clone(),
            company_id: company_id.clone(),
            payload: payload_text,
            payload_base64,
            headers: headers
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect(),
            signature,
            is_valid_signature,
            signature_error: signature_error.clone(),
            source_ip: client_ip_from(headers, socket_ip),
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_string),
            received_at,
            processing_time_ms,
        };

        // Concurrent arrival of the same id: only the first one marks it.
        if !self.dedup.mark_seen(&delivery_id) {
            return duplicate_ack(delivery_id, start);
        }

        let webhook_id = delivery.id.clone();
        self.track(&webhook_id);
        let pipeline = Arc::clone(self);
        let payload = parsed.clone();
        self.tracker.spawn(async move {
            pipeline.process(delivery, payload, mobile_provider).await;
        });

        tracing::info!(
            delivery_id = %delivery_id,
            event_type = %event_type,
            is_valid_signature,
            processing_time_ms,
            "delivery acknowledged"
        );

        let mut ack = AckBody {
            received: true,
            success: true,
            delivery_id,
            webhook_id: Some(webhook_id),
            event_type: Some(event_type),
            company_id,
            is_valid_signature: Some(is_valid_signature),
            signature_error,
            mobile_provider,
            processing_time_ms,
            message: "Webhook received".into(),
            ..Default::default()
        };

        if parsed.is_none() {
            ack.success = false;
            ack.code = Some("INVALID_JSON");
            ack.error = Some("payload is not a JSON object".into());
            ack.message = "Invalid JSON payload".into();
            return Acknowledgement {
                status: StatusCode::BAD_REQUEST,
                body: ack,
            };
        }

        Acknowledgement {
            status: StatusCode::OK,
            body: ack,
        }
    }

    fn check_signature(&self, body: &[u8], signature: Option<&str>, delivery_id: &str) -> (bool, Option<String>) {
        let Some(secret) = self.secret.as_deref() else {
            tracing::debug!(delivery_id, "no secret configured, skipping signature check");
            return (true, None);
        };
        let Some(signature) = signature else {
            tracing::warn!(delivery_id, "delivery has no signature, accepting unverified");
            return (true, None);
        };
        match verification::verify(body, Some(signature), Some(secret)) {
            Ok(()) => (true, None),
            Err(e) => {
                tracing::warn!(delivery_id, error = %e, "invalid delivery signature");
                (false, Some(e.to_string()))
            }
        }
    }

    async fn process(&self, delivery: Delivery, payload: Option<Value>, mobile_provider: Option<&'static str>) {
        let webhook_id = delivery.id.clone();

        match self.store.insert(delivery.clone()).await {
            Ok(_) => {}
            Err(StoreError::DuplicateKey(id)) => {
                tracing::warn!(delivery_id = %id, "delivery already stored, skipping");
                self.untrack(&webhook_id);
                return;
            }
            Err(e) => {
                tracing::error!(delivery_id = %delivery.delivery_id, error = %e, "failed to persist acknowledged delivery");
                self.untrack(&webhook_id);
                return;
            }
        }

        let now = Utc::now();
        let stats = self.store.stats(self.timezone, now).await;
        let message = json!({
            "type": "webhook_received",
            "webhook": delivery.view(self.timezone, now),
            "stats": stats,
            "mobile_provider": mobile_provider,
            "timestamp": now.to_rfc3339(),
        });
        let observers = self.hub.broadcast(&delivery.event_type, &message).await;
        tracing::debug!(delivery_id = %delivery.delivery_id, observers, "delivery broadcast");

        if let Some(payload) = payload {
            self.hooks.run(&delivery, &payload).await;
        }

        self.untrack(&webhook_id);
    }

    /// Ids acknowledged but not yet fully processed.
    pub fn in_flight(&self) -> HashSet<String> {
        self.in_flight_set().clone()
    }

    /// Wait for every background continuation spawned so far.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    fn track(&self, id: &str) {
        self.in_flight_set().insert(id.to_string());
    }

    fn untrack(&self, id: &str) {
        self.in_flight_set().remove(id);
    }

    fn in_flight_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn duplicate_ack(delivery_id: String, start: Instant) -> Acknowledgement {
    tracing::info!(delivery_id = %delivery_id, "duplicate delivery, already processed");
    Acknowledgement {
        status: StatusCode::OK,
        body: AckBody {
            received: true,
            success: true,
            delivery_id,
            already_processed: true,
            processing_time_ms: elapsed_ms(start),
            message: "Webhook already processed".into(),
            ..Default::default()
        },
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `x-forwarded-for` (first hop), then `x-real-ip`, then the socket peer.
pub fn client_ip_from(headers: &HeaderMap, socket_ip: Option<String>) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or(socket_ip)
}
