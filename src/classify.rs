//! Heuristic event-type and tenant inference over arbitrary JSON payloads.
//!
//! Every function here is total: malformed or unexpected shapes fall through
//! to the next rule instead of failing.

use axum::http::HeaderMap;
use serde_json::Value;

pub const UNKNOWN_EVENT: &str = "unknown";
pub const INVALID_PAYLOAD_EVENT: &str = "invalid_payload";

const EVENT_HEADERS: [&str; 2] = ["x-event-type", "x-genuka-event"];
const TENANT_FIELDS: [&str; 3] = ["company_id", "shop_id", "tenant_id"];
const TENANT_HEADERS: [&str; 3] = ["x-company-id", "x-genuka-company", "x-shop-id"];

/// Infer the event type. Explicit signals (payload `event`/`type`, nested
/// `data.type`, event headers) always win over structural inference.
pub fn classify_event(payload: &Value, headers: &HeaderMap) -> String {
    if let Some(explicit) = str_field(payload, "event").or_else(|| str_field(payload, "type")) {
        return explicit.to_string();
    }
    if let Some(nested) = payload.get("data").and_then(|d| str_field(d, "type")) {
        return nested.to_string();
    }
    if let Some(hinted) = EVENT_HEADERS.iter().find_map(|h| header_str(headers, h)) {
        return hinted.to_string();
    }
    infer_from_shape(payload).unwrap_or_else(|| UNKNOWN_EVENT.to_string())
}

fn infer_from_shape(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;

    if let Some(order) = obj.get("order").filter(|o| o.is_object()) {
        return Some(match str_field(order, "status") {
            Some(status) => format!("order.{status}"),
            None => "order.updated".to_string(),
        });
    }

    if let Some(customer) = obj.get("customer").filter(|c| c.is_object()) {
        let has_id = customer.get("id").is_some_and(|id| !id.is_null());
        return Some(if has_id { "customer.updated" } else { "customer.created" }.to_string());
    }

    if obj.get("payment").is_some_and(Value::is_object) {
        return Some("payment.created".to_string());
    }

    if obj.get("product").is_some_and(Value::is_object) {
        return Some("product.updated".to_string());
    }

    None
}

/// Tenant (company/shop) id. Payload fields, including under a `data`
/// wrapper, take precedence over headers.
pub fn extract_tenant_id(payload: &Value, headers: &HeaderMap) -> Option<String> {
    let from_payload = |scope: &Value| TENANT_FIELDS.iter().find_map(|f| scalar_field(scope, f));

    from_payload(payload)
        .or_else(|| payload.get("data").and_then(from_payload))
        .or_else(|| {
            TENANT_HEADERS
                .iter()
                .find_map(|h| header_str(headers, h).map(str::to_string))
        })
}

/// Scan the payload for a Cameroonian mobile money provider.
pub fn detect_mobile_money_provider(payload: &Value) -> Option<&'static str> {
    let text = payload.to_string().to_lowercase();

    if text.contains("orange") || text.contains("#150*1#") {
        Some("Orange Money")
    } else if text.contains("mtn") || text.contains("momo") || text.contains("#126#") {
        Some("MTN Mobile Money")
    } else if text.contains("express union") || text.contains("eu mobile") {
        Some("Express Union Mobile")
    } else if text.contains("uba") && text.contains("mobile") {
        Some("UBA Mobile Banking")
    } else {
        None
    }
}

/// Carrier for a +237 phone number, or `"unknown"`.
pub fn detect_phone_operator(phone: &str) -> &'static str {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    let Some(local) = digits.strip_prefix("237") else {
        return "unknown";
    };
    match local.get(..2) {
        Some("65" | "67" | "68") => "MTN",
        Some("66" | "69") => "Orange",
        Some("62" | "63") => "Camtel",
        _ => "unknown",
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str().filter(|s| !s.is_empty())
}

fn scalar_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
