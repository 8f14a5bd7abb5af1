use crate::classify::{detect_mobile_money_provider, detect_phone_operator};
use crate::error::HookError;
use crate::types::Delivery;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Business logic run after a delivery has been persisted and broadcast.
/// Errors are logged by the registry and never reach the sender.
#[async_trait]
pub trait BusinessHook: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, delivery: &Delivery, payload: &Value) -> Result<(), HookError>;
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<Arc<dyn BusinessHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in order, payment and customer hooks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("order.created", Arc::new(OrderCreated));
        registry.register("order.completed", Arc::new(OrderCompleted));
        registry.register("payment.completed", Arc::new(PaymentCompleted));
        registry.register("payment.failed", Arc::new(PaymentFailed));
        registry.register("customer.created", Arc::new(CustomerCreated));
        registry
    }

    pub fn register(&mut self, event_type: impl Into<String>, hook: Arc<dyn BusinessHook>) {
        self.hooks.entry(event_type.into()).or_default().push(hook);
    }

    #[cfg(test)]
    pub fn has_hooks_for(&self, event_type: &str) -> bool {
        self.hooks.get(event_type).is_some_and(|h| !h.is_empty())
    }

    /// Run every hook registered for the delivery's event type, in
    /// registration order. Returns how many failed.
    pub async fn run(&self, delivery: &Delivery, payload: &Value) -> usize {
        let Some(hooks) = self.hooks.get(&delivery.event_type) else {
            tracing::debug!(event_type = %delivery.event_type, "no business hook for event type");
            return 0;
        };

        let mut failures = 0;
        for hook in hooks {
            if let Err(e) = hook.handle(delivery, payload).await {
                failures += 1;
                tracing::warn!(
                    delivery_id = %delivery.delivery_id,
                    event_type = %delivery.event_type,
                    hook = hook.name(),
                    error = %e,
                    "business hook failed"
                );
            }
        }
        failures
    }
}

// ---------------------------------------------------------------------------
// Built-in hooks
// ---------------------------------------------------------------------------

fn tenant(delivery: &Delivery) -> &str {
    delivery.company_id.as_deref().unwrap_or("unknown")
}

static NULL: Value = Value::Null;

fn field<'a>(object: &'a Value, key: &str) -> &'a Value {
    object.get(key).unwrap_or(&NULL)
}

fn section<'a>(payload: &'a Value, key: &'static str, hook: &'static str) -> Result<&'a Value, HookError> {
    payload
        .get(key)
        .or_else(|| payload.get("data").and_then(|d| d.get(key)))
        .filter(|v| v.is_object())
        .ok_or_else(|| HookError {
            hook,
            message: format!("payload has no `{key}` object"),
        })
}

struct OrderCreated;

#[async_trait]
impl BusinessHook for OrderCreated {
    fn name(&self) -> &'static str {
        "order_created"
    }

    async fn handle(&self, delivery: &Delivery, payload: &Value) -> Result<(), HookError> {
        let order = section(payload, "order", self.name())?;
        tracing::info!(company_id = tenant(delivery), order_id = %field(order, "id"), "new order");

        if let Some(phone) = order.pointer("/customer/phone").and_then(Value::as_str) {
            tracing::info!(
                operator = detect_phone_operator(phone),
                total = %field(order, "total"),
                "order customer reachable by phone"
            );
        }
        Ok(())
    }
}

struct OrderCompleted;

#[async_trait]
impl BusinessHook for OrderCompleted {
    fn name(&self) -> &'static str {
        "order_completed"
    }

    async fn handle(&self, delivery: &Delivery, payload: &Value) -> Result<(), HookError> {
        let order = section(payload, "order", self.name())?;
        tracing::info!(company_id = tenant(delivery), order_id = %field(order, "id"), "order completed");
        Ok(())
    }
}

struct PaymentCompleted;

#[async_trait]
impl BusinessHook for PaymentCompleted {
    fn name(&self) -> &'static str {
        "payment_completed"
    }

    async fn handle(&self, delivery: &Delivery, payload: &Value) -> Result<(), HookError> {
        let payment = section(payload, "payment", self.name())?;
        tracing::info!(
            company_id = tenant(delivery),
            reference = %field(payment, "reference"),
            "payment completed"
        );
        if let Some(provider) = detect_mobile_money_provider(payment) {
            tracing::info!(provider, "mobile money payment");
        }
        Ok(())
    }
}

struct PaymentFailed;

#[async_trait]
impl BusinessHook for PaymentFailed {
    fn name(&self) -> &'static str {
        "payment_failed"
    }

    async fn handle(&self, delivery: &Delivery, payload: &Value) -> Result<(), HookError> {
        let payment = section(payload, "payment", self.name())?;
        tracing::warn!(
            company_id = tenant(delivery),
            reference = %field(payment, "reference"),
            reason = %field(payment, "error"),
            "payment failed"
        );
        Ok(())
    }
}

struct CustomerCreated;

#[async_trait]
impl BusinessHook for CustomerCreated {
    fn name(&self) -> &'static str {
        "customer_created"
    }

    async fn handle(&self, delivery: &Delivery, payload: &Value) -> Result<(), HookError> {
        let customer = section(payload, "customer", self.name())?;
        tracing::info!(
            company_id = tenant(delivery),
            email = %field(customer, "email"),
            "new customer"
        );
        Ok(())
    }
}
