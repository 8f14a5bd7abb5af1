//! Live fan-out of deliveries to observer connections.
//!
//! The hub owns every connection. Transport tasks talk to it through the
//! connection id and receive frames from a bounded channel; a full or closed
//! channel means the observer is gone and it is dropped on the spot.

use crate::error::HubError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct ObserverConnection {
    id: String,
    remote_addr: Option<String>,
    user_agent: Option<String>,
    connected_at: DateTime<Utc>,
    subscriptions: Mutex<HashSet<String>>,
    state: Mutex<ConnectionState>,
    alive: AtomicBool,
    sender: mpsc::Sender<Outbound>,
}

impl ObserverConnection {
    pub fn new(
        remote_addr: Option<String>,
        user_agent: Option<String>,
        sender: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            user_agent,
            connected_at: Utc::now(),
            subscriptions: Mutex::new(HashSet::new()),
            state: Mutex::new(ConnectionState::Connecting),
            alive: AtomicBool::new(true),
            sender,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Empty subscription set receives everything.
    pub fn wants(&self, event_type: &str) -> bool {
        let subs = lock(&self.subscriptions);
        subs.is_empty() || subs.contains(event_type)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn try_send(&self, frame: Outbound) -> bool {
        self.sender.try_send(frame).is_ok()
    }

    fn summary(&self) -> ConnectionSummary {
        let mut subscriptions: Vec<String> = lock(&self.subscriptions).iter().cloned().collect();
        subscriptions.sort();
        ConnectionSummary {
            id: self.id.clone(),
            ip: self.remote_addr.clone(),
            user_agent: self.user_agent.clone(),
            connected_at: self.connected_at,
            subscriptions,
            is_alive: self.alive.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub is_alive: bool,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub total_broadcasts: u64,
    pub active_connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        events: Vec<String>,
    },
}

pub struct BroadcastHub {
    connections: RwLock<HashMap<String, Arc<ObserverConnection>>>,
    /// 0 = unlimited
    max_connections: usize,
    total_broadcasts: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_max_connections(0)
    }

    pub fn with_max_connections(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            total_broadcasts: AtomicU64::new(0),
        }
    }

    /// Add a connection, mark it open and queue the welcome frame.
    pub async fn register(&self, conn: ObserverConnection) -> Result<Arc<ObserverConnection>, HubError> {
        let conn = Arc::new(conn);
        let client_count = {
            let mut connections = self.connections.write().await;
            if self.max_connections > 0 && connections.len() >= self.max_connections {
                conn.set_state(ConnectionState::Closed);
                return Err(HubError::ConnectionLimit(self.max_connections));
            }
            connections.insert(conn.id.clone(), conn.clone());
            connections.len()
        };
        conn.set_state(ConnectionState::Open);

        tracing::info!(
            conn_id = %conn.id,
            remote_addr = conn.remote_addr.as_deref().unwrap_or("unknown"),
            client_count,
            "observer connected"
        );

        let welcome = json!({
            "type": "connected",
            "message": "Connected to webhook stream",
            "connection_id": conn.id,
            "client_count": client_count,
            "timestamp": Utc::now().to_rfc3339(),
        });
        conn.try_send(Outbound::Text(welcome.to_string()));
        Ok(conn)
    }

    pub async fn unregister(&self, conn_id: &str) {
        if let Some(conn) = self.connections.write().await.remove(conn_id) {
            conn.set_state(ConnectionState::Closed);
            tracing::info!(conn_id, "observer disconnected");
        }
    }

    /// Refresh liveness; any inbound frame counts.
    pub async fn mark_alive(&self, conn_id: &str) {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            conn.alive.store(true, Ordering::Relaxed);
        }
    }

    /// Handle a text frame sent by an observer.
    pub async fn handle_client_message(&self, conn_id: &str, text: &str) {
        let Some(conn) = self.connections.read().await.get(conn_id).cloned() else {
            return;
        };
        conn.alive.store(true, Ordering::Relaxed);

        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ping) => json!({
                "type": "pong",
                "timestamp": Utc::now().to_rfc3339(),
            }),
            Ok(ClientMessage::Subscribe { events }) => {
                {
                    let mut subs = lock(&conn.subscriptions);
                    subs.clear();
                    subs.extend(events.iter().filter(|e| !e.is_empty()).cloned());
                }
                tracing::debug!(conn_id, ?events, "observer subscribed");
                json!({ "type": "subscribed", "events": events })
            }
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "ignoring unrecognised observer message");
                return;
            }
        };

        if !conn.try_send(Outbound::Text(reply.to_string())) {
            self.unregister(conn_id).await;
        }
    }

    /// Send `message` to every connection subscribed to `event_type`.
    /// Returns how many connections accepted it. Connections that fail are
    /// removed; the failure is never surfaced.
    pub async fn broadcast(&self, event_type: &str, message: &Value) -> usize {
        self.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        let text = message.to_string();

        let snapshot: Vec<Arc<ObserverConnection>> =
            self.connections.read().await.values().cloned().collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in snapshot.iter().filter(|c| c.wants(event_type)) {
            if conn.try_send(Outbound::Text(text.clone())) {
                delivered += 1;
            } else {
                failed.push(conn.id.clone());
            }
        }

        for conn_id in failed {
            tracing::debug!(conn_id = %conn_id, "dropping observer after failed send");
            self.unregister(&conn_id).await;
        }
        delivered
    }

    /// One heartbeat cycle: evict connections that have not answered since the
    /// previous cycle, then ping the rest. Returns the number evicted.
    pub async fn heartbeat_sweep(&self) -> usize {
        let snapshot: Vec<Arc<ObserverConnection>> =
            self.connections.read().await.values().cloned().collect();

        let mut dead = Vec::new();
        for conn in &snapshot {
            if !conn.alive.swap(false, Ordering::Relaxed) {
                conn.set_state(ConnectionState::Closing);
                conn.try_send(Outbound::Close);
                dead.push(conn.id.clone());
            } else if !conn.try_send(Outbound::Ping) {
                dead.push(conn.id.clone());
            }
        }

        for conn_id in &dead {
            tracing::warn!(conn_id = %conn_id, "evicting unresponsive observer");
            self.unregister(conn_id).await;
        }
        dead.len()
    }

    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat_sweep().await;
                }
            }
        }
        tracing::debug!("heartbeat loop stopped");
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        let connections = self.connections.read().await;
        let mut active: Vec<ConnectionSummary> = connections.values().map(|c| c.summary()).collect();
        active.sort_by_key(|c| c.connected_at);
        HubStats {
            total_connections: connections.len(),
            total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
            active_connections: active,
        }
    }

    /// Ask every connection to close and forget them.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (_, conn) in &drained {
            conn.set_state(ConnectionState::Closing);
            conn.try_send(Outbound::Close);
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "closed all observer connections");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
