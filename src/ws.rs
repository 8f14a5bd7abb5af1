use crate::hub::{BroadcastHub, ObserverConnection, Outbound};
use crate::http_server::ServerState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, Extensions, HeaderMap},
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

pub async fn ws_handler(
    upgrade: WebSocketUpgrade,
    State(state): State<ServerState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let remote_addr = crate::http_server::client_ip(&headers, &extensions);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let hub = state.hub.clone();

    upgrade.on_upgrade(move |socket| handle_socket(socket, hub, remote_addr, user_agent))
}

async fn handle_socket(
    socket: WebSocket,
    hub: Arc<BroadcastHub>,
    remote_addr: Option<String>,
    user_agent: Option<String>,
) {
    let (tx, rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
    let (mut ws_sender, ws_receiver) = socket.split();

    let conn_id = match hub
        .register(ObserverConnection::new(remote_addr, user_agent, tx))
        .await
    {
        Ok(conn) => conn.id().to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "rejecting observer connection");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    run_connection(ws_sender, ws_receiver, rx, &hub, &conn_id).await;
}

/// Pump hub frames out and client frames in until either side finishes.
/// The writer ends on a close frame (eviction or shutdown), the reader on
/// peer close or error; whichever ends first drops the other.
async fn run_connection<W, R, E>(
    mut sink: W,
    mut stream: R,
    mut rx: mpsc::Receiver<Outbound>,
    hub: &BroadcastHub,
    conn_id: &str,
) where
    W: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let send = async {
        while let Some(frame) = rx.recv().await {
            let (msg, closing) = match frame {
                Outbound::Text(text) => (Message::Text(text.into()), false),
                Outbound::Ping => (Message::Ping(Default::default()), false),
                Outbound::Close => (Message::Close(None), true),
            };
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    let recv = async {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => hub.handle_client_message(conn_id, text.as_str()).await,
                Message::Pong(_) | Message::Ping(_) => hub.mark_alive(conn_id).await,
                Message::Close(_) => break,
                Message::Binary(_) => {}
            }
        }
    };

    tokio::select! {
        _ = send => tracing::debug!(conn_id, "observer writer finished"),
        _ = recv => tracing::debug!(conn_id, "observer reader finished"),
    }

    hub.unregister(conn_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn evicted_connection_ends_even_if_peer_is_silent() {
        let hub = Arc::new(BroadcastHub::new());
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let conn = hub
            .register(ObserverConnection::new(None, None, tx))
            .await
            .unwrap();
        let conn_id = conn.id().to_string();
        drop(conn);

        let task = {
            let hub = hub.clone();
            tokio::spawn(async move {
                // Peer never sends anything, not even a close frame.
                let silent = futures::stream::pending::<Result<Message, axum::Error>>();
                run_connection(futures::sink::drain(), silent, rx, &hub, &conn_id).await;
            })
        };

        hub.heartbeat_sweep().await;
        hub.heartbeat_sweep().await;

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("connection task should end after eviction")
            .unwrap();
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn peer_close_unregisters() {
        let hub = Arc::new(BroadcastHub::new());
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let conn = hub
            .register(ObserverConnection::new(None, None, tx))
            .await
            .unwrap();
        let conn_id = conn.id().to_string();
        drop(conn);

        let frames = futures::stream::iter(vec![
            Ok::<_, axum::Error>(Message::Text(r#"{"type":"ping"}"#.into())),
            Ok(Message::Close(None)),
        ]);
        tokio::time::timeout(
            Duration::from_secs(2),
            run_connection(futures::sink::drain(), frames, rx, &hub, &conn_id),
        )
        .await
        .unwrap();
        assert_eq!(hub.connection_count().await, 0);
    }
}
