use crate::localtime;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One received webhook, captured verbatim. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    /// Idempotency key supplied by the sender (or generated on receipt).
    pub delivery_id: String,
    pub event_type: String,
    pub company_id: Option<String>,
    /// Request body as text. Exact unless `payload_base64` is set.
    pub payload: String,
    /// Base64 of the raw body, kept only when it was not valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_base64: Option<String>,
    /// Request headers in arrival order; names may repeat.
    pub headers: Vec<(String, String)>,
    pub signature: Option<String>,
    pub is_valid_signature: bool,
    pub signature_error: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processing_time_ms: u64,
}

impl Delivery {
    /// Capture a request body, keeping invalid UTF-8 recoverable.
    pub fn capture_body(body: &[u8]) -> (String, Option<String>) {
        match std::str::from_utf8(body) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (
                String::from_utf8_lossy(body).into_owned(),
                Some(BASE64.encode(body)),
            ),
        }
    }

    /// The body bytes exactly as they arrived.
    pub fn raw_body(&self) -> Vec<u8> {
        self.payload_base64
            .as_deref()
            .and_then(|b64| BASE64.decode(b64).ok())
            .unwrap_or_else(|| self.payload.clone().into_bytes())
    }

    /// Structured form of the payload; falls back to the raw text when it
    /// is not JSON.
    pub fn parsed_payload(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or_else(|_| Value::String(self.payload.clone()))
    }

    /// Headers as a JSON object; repeated names are joined with `, `.
    pub fn headers_object(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.headers {
            match map.get_mut(name) {
                Some(Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                _ => {
                    map.insert(name.clone(), Value::String(value.clone()));
                }
            }
        }
        map
    }

    pub fn view(&self, tz: Tz, now: DateTime<Utc>) -> DeliveryView {
        DeliveryView {
            id: self.id.clone(),
            delivery_id: self.delivery_id.clone(),
            event_type: self.event_type.clone(),
            company_id: self.company_id.clone(),
            payload: self.parsed_payload(),
            raw_payload: self.payload.clone(),
            headers: Value::Object(self.headers_object()),
            signature: self.signature.clone(),
            is_valid_signature: self.is_valid_signature,
            signature_error: self.signature_error.clone(),
            source_ip: self.source_ip.clone(),
            user_agent: self.user_agent.clone(),
            received_at: self.received_at,
            received_at_local: localtime::to_local(self.received_at, tz).to_rfc3339(),
            received_at_human: localtime::humanize(self.received_at, now, tz),
            processing_time_ms: self.processing_time_ms,
        }
    }
}

/// API/broadcast rendering of a [`Delivery`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryView {
    pub id: String,
    pub delivery_id: String,
    pub event_type: String,
    pub company_id: Option<String>,
    pub payload: Value,
    pub raw_payload: String,
    pub headers: Value,
    pub signature: Option<String>,
    pub is_valid_signature: bool,
    pub signature_error: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
    pub received_at_local: String,
    pub received_at_human: String,
    pub processing_time_ms: u64,
}

/// Conjunctive filter for listing deliveries. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub event_type: Option<String>,
    pub company_id: Option<String>,
    pub is_valid_signature: Option<bool>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of payload, event type or company id.
    pub search: Option<String>,
}

impl DeliveryFilter {
    pub fn matches(&self, d: &Delivery) -> bool {
        if self.event_type.as_deref().is_some_and(|t| t != d.event_type) {
            return false;
        }
        if let Some(company) = self.company_id.as_deref() {
            if d.company_id.as_deref() != Some(company) {
                return false;
            }
        }
        if self.is_valid_signature.is_some_and(|v| v != d.is_valid_signature) {
            return false;
        }
        if self.date_from.is_some_and(|from| d.received_at < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| d.received_at > to) {
            return false;
        }
        if let Some(needle) = self.search.as_deref().map(str::to_lowercase).filter(|s| !s.is_empty()) {
            let hit = d.payload.to_lowercase().contains(&needle)
                || d.event_type.to_lowercase().contains(&needle)
                || d.company_id
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset.saturating_add(self.limit) < self.total
    }

    pub fn pagination(&self) -> Pagination {
        Pagination {
            total: self.total,
            limit: self.limit,
            offset: self.offset,
            has_more: self.has_more(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pagination {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountEntry {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HourlyBucket {
    /// Local start of the hour, `HH:00`.
    pub hour: String,
    pub start: DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryStats {
    pub total_webhooks: usize,
    pub today_webhooks: usize,
    pub valid_signatures: usize,
    pub invalid_signatures: usize,
    /// Sorted by count, descending.
    pub event_types: Vec<CountEntry>,
    pub companies: Vec<CountEntry>,
    /// Oldest first, 24 entries ending with the current local hour.
    pub hourly: Vec<HourlyBucket>,
    pub avg_processing_time_ms: f64,
    pub timezone: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> Delivery {
        Delivery {
            id: "id-1".into(),
            delivery_id: "d-1".into(),
            event_type: "order.created".into(),
            company_id: Some("Acme".into()),
            payload: r#"{"event":"order.created","note":"Orange Money"}"#.into(),
            payload_base64: None,
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("x-tag".into(), "a".into()),
                ("x-tag".into(), "b".into()),
            ],
            signature: None,
            is_valid_signature: true,
            signature_error: None,
            source_ip: None,
            user_agent: None,
            received_at: Utc::now(),
            processing_time_ms: 3,
        }
    }

    #[test]
    fn repeated_headers_are_joined() {
        let obj = delivery().headers_object();
        assert_eq!(obj["x-tag"], "a, b");
        assert_eq!(obj["content-type"], "application/json");
    }

    #[test]
    fn has_more_saturates_on_huge_offset() {
        let page = Page::<()> { items: vec![], total: 10, limit: 50, offset: usize::MAX };
        assert!(!page.has_more());
        let page = Page::<()> { items: vec![], total: 10, limit: 5, offset: 0 };
        assert!(page.has_more());
    }

    #[test]
    fn binary_body_survives_capture() {
        let body = [0x7b, 0xff, 0xfe, 0x7d];
        let (text, b64) = Delivery::capture_body(&body);
        assert!(text.contains('\u{fffd}'));
        assert!(b64.is_some());

        let mut d = delivery();
        d.payload = text;
        d.payload_base64 = b64;
        assert_eq!(d.raw_body(), body);

        let line = serde_json::to_string(&d).unwrap();
        let reloaded: Delivery = serde_json::from_str(&line).unwrap();
        assert_eq!(reloaded.raw_body(), body);
    }

    #[test]
    fn utf8_body_is_kept_as_text_only() {
        let (text, b64) = Delivery::capture_body("café".as_bytes());
        assert_eq!(text, "café");
        assert!(b64.is_none());
        let d = delivery();
        assert!(!serde_json::to_string(&d).unwrap().contains("payload_base64"));
        assert_eq!(d.raw_body(), d.payload.as_bytes());
    }

    #[test]
    fn non_json_payload_renders_as_string() {
        let mut d = delivery();
        d.payload = "not json".into();
        assert_eq!(d.parsed_payload(), Value::String("not json".into()));
    }

    #[test]
    fn search_is_case_insensitive_across_fields() {
        let d = delivery();
        let by = |s: &str| DeliveryFilter { search: Some(s.into()), ..Default::default() };
        assert!(by("orange money").matches(&d));
        assert!(by("ORDER.CREATED").matches(&d));
        assert!(by("acme").matches(&d));
        assert!(!by("payment").matches(&d));
    }

    #[test]
    fn filters_are_conjunctive() {
        let d = delivery();
        let f = DeliveryFilter {
            event_type: Some("order.created".into()),
            company_id: Some("Acme".into()),
            is_valid_signature: Some(false),
            ..Default::default()
        };
        assert!(!f.matches(&d));
        let f = DeliveryFilter { is_valid_signature: Some(true), ..f };
        assert!(f.matches(&d));
    }

    #[test]
    fn has_more_uses_offset_plus_limit() {
        let page = Page::<()> { items: vec![], total: 10, limit: 5, offset: 5 };
        assert!(!page.has_more());
        let page = Page::<()> { items: vec![], total: 11, limit: 5, offset: 5 };
        assert!(page.has_more());
    }
}
