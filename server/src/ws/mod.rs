//! WebSocket multiplexer for watch subscriptions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws`. Past `server.max_connections` the
//!    upgrade is refused with `503`.
//! 2. The server sends `{"type":"ready"}` before anything else.
//! 3. The client sends `subscribe`/`unsubscribe` frames (see
//!    [`crate::protocol`]). Any number of subscriptions share the socket.
//! 4. On close, read error, write error or server shutdown every watch owned
//!    by the connection is cancelled and awaited.
//!
//! ## Tasks per connection
//!
//! | Task      | Role                                                        |
//! |-----------|-------------------------------------------------------------|
//! | writer    | Sole owner of the socket sink; drains the outbound channel  |
//! | keepalive | Queues a transport ping every `ws.ping_interval_secs`       |
//! | stats     | Queues a `stats` frame every `ws.stats_interval_ms`         |
//! | relays    | One per composite key (see [`crate::watch`])                |
//!
//! The read loop runs on the upgrade task itself. Client pings are answered
//! by the WebSocket layer, which flushes the pong with the writer's next
//! frame, so frames are never written concurrently.

pub mod connection;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::stats::Counters;
use crate::watch::RelaySettings;
use crate::AppState;
use connection::Connection;

/// How long the writer gets to flush queued frames after the read loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One frame queued for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
}

/// Holds one slot of the connection gauge; released on drop.
pub struct ConnectionSlot(Arc<AtomicU32>);

impl ConnectionSlot {
    /// Claim a slot, or `None` if `max` connections are already open.
    pub fn acquire(gauge: &Arc<AtomicU32>, max: u32) -> Option<Self> {
        let prev = gauge.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            gauge.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(Arc::clone(gauge)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// `GET /api/ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max = state.config.server.max_connections;
    let Some(slot) = ConnectionSlot::acquire(&state.connections, max) else {
        warn!("WS: connection limit reached ({max}), refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        handle_ws(socket, state).await;
        drop(slot);
    })
}

/// Drive one connection until it closes.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let ws_config = &state.config.ws;

    let (tx, mut rx) = mpsc::channel::<Outbound>(ws_config.outbound_buffer.max(1));
    let counters = Arc::new(Counters::new());
    let cancel = state.shutdown.child_token();

    // Writer: the only place frames hit the socket.
    let send_task = {
        let counters = Arc::clone(&counters);
        let cancel = cancel.clone();
        let conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let msg = match frame {
                    Outbound::Message(msg) => match serde_json::to_string(&msg) {
                        Ok(text) => {
                            counters.record_sent(text.len() as u64);
                            Message::Text(text.into())
                        }
                        Err(e) => {
                            error!("WS: [{conn_id}] failed to serialize frame: {e}");
                            continue;
                        }
                    },
                    Outbound::Ping => Message::Ping(Bytes::new()),
                };
                if let Err(e) = ws_sink.send(msg).await {
                    debug!("WS: [{conn_id}] write failed: {e}");
                    break;
                }
            }
            cancel.cancel();
            let _ = ws_sink.close().await;
        })
    };

    let keepalive_task = spawn_ticker(ws_config.ping_interval(), tx.clone(), cancel.clone(), || {
        Outbound::Ping
    });

    let stats_interval = ws_config.stats_interval();
    let stats_task = {
        let counters = Arc::clone(&counters);
        spawn_ticker(stats_interval, tx.clone(), cancel.clone(), move || {
            Outbound::Message(ServerMessage::stats(
                counters.take(),
                stats_interval.as_secs_f64(),
            ))
        })
    };

    let mut conn = Connection::new(
        conn_id.clone(),
        Arc::clone(&state.upstream),
        RelaySettings::from(&state.config.watch),
        tx.clone(),
        Arc::clone(&counters),
        cancel.clone(),
    );

    if conn.open().await {
        info!(
            "WS: [{conn_id}] client connected ({} open)",
            state.connections.load(Ordering::Relaxed)
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                ws_msg = ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => conn.handle_text(text.as_str()).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!("WS: [{conn_id}] read failed: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    conn.close().await;
    keepalive_task.abort();
    stats_task.abort();
    drop(conn);
    drop(tx);

    let abort = send_task.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task)
        .await
        .is_err()
    {
        abort.abort();
    }
    info!("WS: [{conn_id}] client disconnected");
}

/// Queue `make()` every `period` until cancelled or the writer is gone.
/// The first frame goes out one full period after start.
fn spawn_ticker<F>(
    period: Duration,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    make: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Outbound + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if tx.send(make()).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::config::Config;
    use crate::upstream::{EventKind, Upstream, WatchEvent};
    use crate::watch::relay::tests::{wait_until, FakeUpstream};

    async fn serve(config: Config) -> (SocketAddr, Arc<FakeUpstream>, AppState) {
        let upstream = Arc::new(FakeUpstream::default());
        let state = AppState::new(config, Arc::clone(&upstream) as Arc<dyn Upstream>);
        let app = crate::routes::router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, upstream, state)
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("socket closed")
                .unwrap();
            if msg.is_text() {
                return serde_json::from_str(msg.to_text().unwrap()).unwrap();
            }
        }
    }

    #[test]
    fn connection_slots_are_bounded() {
        let gauge = Arc::new(AtomicU32::new(0));
        let a = ConnectionSlot::acquire(&gauge, 2).unwrap();
        let _b = ConnectionSlot::acquire(&gauge, 2).unwrap();
        assert!(ConnectionSlot::acquire(&gauge, 2).is_none());
        assert_eq!(gauge.load(Ordering::SeqCst), 2);
        drop(a);
        assert!(ConnectionSlot::acquire(&gauge, 2).is_some());
    }

    #[tokio::test]
    async fn end_to_end_subscribe_and_stream() {
        let mut config = Config::default();
        config.ws.stats_interval_ms = 100;
        let (addr, upstream, state) = serve(config).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await, json!({"type": "ready"}));

        let subscribe = json!({
            "id": "1",
            "action": "subscribe",
            "path": "/api/v1/pods",
            "params": {"fields": "status.phase"}
        });
        ws.send(WsMessage::text(subscribe.to_string())).await.unwrap();
        let ack = next_json(&mut ws).await;
        assert_eq!(ack["type"], "status");
        assert_eq!(ack["data"]["type"], "subscribed");

        let up = Arc::clone(&upstream);
        wait_until(move || up.opened() == 1).await;
        upstream.emit(
            "/api/v1/pods",
            Ok(WatchEvent::new(
                EventKind::Added,
                json!({"kind": "Pod", "metadata": {"name": "web-0"}, "status": {"phase": "Running", "podIP": "10.0.0.1"}}),
            )),
        );

        let mut saw_data = false;
        let mut saw_stats = false;
        while !(saw_data && saw_stats) {
            let frame = next_json(&mut ws).await;
            match frame["type"].as_str() {
                Some("data") => {
                    assert_eq!(frame["id"], "1");
                    assert_eq!(frame["data"]["object"]["status"], json!({"phase": "Running"}));
                    saw_data = true;
                }
                Some("stats") => {
                    assert!(frame["data"]["interval_secs"].is_number());
                    saw_stats = true;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(state.connections.load(Ordering::SeqCst), 1);

        ws.close(None).await.unwrap();
        let up = Arc::clone(&upstream);
        wait_until(move || up.closed() == 1).await;
        let gauge = Arc::clone(&state.connections);
        wait_until(move || gauge.load(Ordering::SeqCst) == 0).await;
    }

    #[tokio::test]
    async fn client_ping_gets_exactly_one_pong() {
        let mut config = Config::default();
        config.ws.stats_interval_ms = 50;
        let (addr, _upstream, _state) = serve(config).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .unwrap();
        next_json(&mut ws).await;

        ws.send(WsMessage::Ping(b"hb".to_vec().into())).await.unwrap();
        let mut pongs = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, ws.next()).await {
            if let WsMessage::Pong(payload) = msg.unwrap() {
                assert_eq!(&payload[..], b"hb");
                pongs += 1;
            }
        }
        assert_eq!(pongs, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_live_connections() {
        let (addr, upstream, state) = serve(Config::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .unwrap();
        next_json(&mut ws).await;
        ws.send(WsMessage::text(
            json!({"id": "1", "action": "subscribe", "path": "/pods"}).to_string(),
        ))
        .await
        .unwrap();
        next_json(&mut ws).await;
        let up = Arc::clone(&upstream);
        wait_until(move || up.opened() == 1).await;

        state.shutdown.cancel();
        let up = Arc::clone(&upstream);
        wait_until(move || up.closed() == 1).await;
    }
}
