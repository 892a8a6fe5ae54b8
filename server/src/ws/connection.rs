//! Per-connection state machine and subscription handling.
//!
//! `Connecting → Ready → Closing → Closed`. The socket plumbing lives in the
//! parent module; this type owns the registry and turns client frames into
//! registry mutations and relay starts. All mutations happen from the read
//! loop, one frame at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Outbound;
use crate::protocol::{parse_client_message, Action, ClientMessage, ServerMessage};
use crate::stats::Counters;
use crate::upstream::Upstream;
use crate::watch::{Registry, Relay, RelaySettings};

/// How long `close` waits for a relay to notice cancellation before
/// aborting it.
const RELAY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const NOT_SUBSCRIBED: &str = "not subscribed to this path";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

pub struct Connection {
    id: String,
    state: ConnectionState,
    registry: Arc<Mutex<Registry>>,
    counters: Arc<Counters>,
    outbound: mpsc::Sender<Outbound>,
    upstream: Arc<dyn Upstream>,
    settings: RelaySettings,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        id: String,
        upstream: Arc<dyn Upstream>,
        settings: RelaySettings,
        outbound: mpsc::Sender<Outbound>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            registry: Arc::new(Mutex::new(Registry::new())),
            counters,
            outbound,
            upstream,
            settings,
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn registry(&self) -> &Arc<Mutex<Registry>> {
        &self.registry
    }

    /// Send `ready` and start accepting frames. Returns `false` if the
    /// writer is already gone.
    pub async fn open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return self.state == ConnectionState::Ready;
        }
        if self.send(ServerMessage::ready()).await {
            self.state = ConnectionState::Ready;
            info!("WS: [{}] ready", self.id);
            true
        } else {
            false
        }
    }

    /// Dispatch one client text frame. Protocol errors are reported to the
    /// client and never close the connection.
    pub async fn handle_text(&mut self, text: &str) {
        if self.state != ConnectionState::Ready {
            return;
        }
        let msg = match parse_client_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("WS: [{}] rejected frame: {e}", self.id);
                self.send(e.into()).await;
                return;
            }
        };
        match msg.action {
            Action::Subscribe => self.subscribe(&msg).await,
            Action::Unsubscribe => self.unsubscribe(&msg).await,
        }
    }

    async fn subscribe(&mut self, msg: &ClientMessage) {
        let req = match msg.subscribe_request() {
            Ok(req) => req,
            Err(e) => {
                self.send(e.into()).await;
                return;
            }
        };
        let key = req.key();
        let path = req.path.to_string();

        // Reserve before locking so the ack is queued ahead of any data the
        // relay pushes for this id.
        let Ok(permit) = self.outbound.reserve().await else {
            return;
        };
        let mut registry = self.registry.lock().await;
        let binding = registry.bind(&req.id, &key);
        if let Some(old) = &binding.replaced {
            debug!("WS: [{}] id {} moved from {old} to {key}", self.id, req.id);
        }
        if binding.joined_existing {
            debug!("WS: [{}] id {} joined {key}", self.id, req.id);
        } else {
            let cancel = self.cancel.child_token();
            let generation =
                registry.register(&key, req.path.clone(), req.fields.clone(), cancel.clone());
            let task = Relay {
                key: key.clone(),
                path: req.path,
                fields: req.fields,
                generation,
                cancel,
                registry: Arc::clone(&self.registry),
                outbound: self.outbound.clone(),
                counters: Arc::clone(&self.counters),
                upstream: Arc::clone(&self.upstream),
                settings: self.settings,
            }
            .spawn();
            registry.attach_task(&key, generation, task);
            info!(
                "WS: [{}] watch started for {key} ({} active)",
                self.id,
                registry.watch_count()
            );
        }
        permit.send(Outbound::Message(ServerMessage::status(
            &req.id,
            &path,
            "subscribed",
        )));
    }

    async fn unsubscribe(&mut self, msg: &ClientMessage) {
        if msg.id.is_empty() {
            self.unsubscribe_path(msg).await;
            return;
        }

        let Ok(permit) = self.outbound.reserve().await else {
            return;
        };
        let mut registry = self.registry.lock().await;
        let Some(release) = registry.unbind(&msg.id) else {
            drop(registry);
            let path = (!msg.path.is_empty()).then_some(msg.path.as_str());
            permit.send(Outbound::Message(ServerMessage::error(
                Some(&msg.id),
                path,
                NOT_SUBSCRIBED,
            )));
            return;
        };
        if release.torn_down {
            info!(
                "WS: [{}] watch stopped for {} ({} active)",
                self.id,
                release.key,
                registry.watch_count()
            );
        }
        permit.send(Outbound::Message(ServerMessage::status(
            &msg.id,
            &release.path,
            "unsubscribed",
        )));
    }

    /// Path-only unsubscribe: release every id mapped to the named key.
    async fn unsubscribe_path(&mut self, msg: &ClientMessage) {
        let key = match msg.path_key() {
            Ok(key) => key,
            Err(e) => {
                self.send(e.into()).await;
                return;
            }
        };
        let released: Vec<_> = {
            let mut registry = self.registry.lock().await;
            registry
                .ids_for(&key)
                .into_iter()
                .filter_map(|id| registry.unbind(&id).map(|r| (id, r)))
                .collect()
        };
        if released.is_empty() {
            self.send(ServerMessage::error(None, Some(&msg.path), NOT_SUBSCRIBED))
                .await;
            return;
        }
        for (id, release) in released {
            self.send(ServerMessage::status(&id, &release.path, "unsubscribed"))
                .await;
        }
    }

    /// Cancel every relay and wait for them to stop. Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        let tasks = self.registry.lock().await.drain();
        self.cancel.cancel();

        let count = tasks.len();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(RELAY_STOP_TIMEOUT, task).await.is_err() {
                warn!("WS: [{}] relay did not stop in time, aborting", self.id);
                abort.abort();
            }
        }
        self.state = ConnectionState::Closed;
        info!("WS: [{}] closed, {count} watch(es) cancelled", self.id);
    }

    async fn send(&self, msg: ServerMessage) -> bool {
        self.outbound.send(Outbound::Message(msg)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::protocol::MessageType;
    use crate::upstream::{EventKind, WatchEvent};
    use crate::watch::relay::tests::{wait_until, FakeUpstream};

    struct Client {
        conn: Connection,
        rx: mpsc::Receiver<Outbound>,
        upstream: Arc<FakeUpstream>,
    }

    impl Client {
        async fn open() -> Self {
            let (tx, rx) = mpsc::channel(64);
            let upstream = Arc::new(FakeUpstream::default());
            let mut conn = Connection::new(
                "test".to_string(),
                Arc::clone(&upstream) as Arc<dyn Upstream>,
                RelaySettings::default(),
                tx,
                Arc::new(Counters::new()),
                CancellationToken::new(),
            );
            assert!(conn.open().await);
            Self { conn, rx, upstream }
        }

        async fn send(&mut self, frame: serde_json::Value) {
            self.conn.handle_text(&frame.to_string()).await;
        }

        async fn subscribe(&mut self, id: &str, path: &str) {
            self.send(json!({"id": id, "action": "subscribe", "path": path}))
                .await;
        }

        async fn unsubscribe(&mut self, id: &str) {
            self.send(json!({"id": id, "action": "unsubscribe"})).await;
        }

        async fn next(&mut self) -> ServerMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            match frame {
                Outbound::Message(msg) => msg,
                _ => panic!("unexpected control frame"),
            }
        }

        async fn assert_quiet(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await;
            assert!(next.is_err(), "unexpected frame: {next:?}");
        }

        async fn opened(&self, n: usize) {
            let up = Arc::clone(&self.upstream);
            wait_until(move || up.opened() == n).await;
        }

        async fn closed(&self, n: usize) {
            let up = Arc::clone(&self.upstream);
            wait_until(move || up.closed() == n).await;
        }
    }

    #[tokio::test]
    async fn ready_is_first_frame() {
        let mut c = Client::open().await;
        assert_eq!(c.next().await.kind, MessageType::Ready);
        assert_eq!(c.conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn identical_subscriptions_share_one_watch() {
        let mut c = Client::open().await;
        c.next().await;

        c.subscribe("A", "/pods").await;
        c.subscribe("B", "/pods").await;
        assert_eq!(c.next().await.status_type(), Some("subscribed"));
        assert_eq!(c.next().await.status_type(), Some("subscribed"));
        c.opened(1).await;

        c.upstream.emit(
            "/pods",
            Ok(WatchEvent::new(EventKind::Added, json!({"metadata": {"name": "p"}}))),
        );
        let mut ids = vec![c.next().await.id.unwrap(), c.next().await.id.unwrap()];
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);

        c.unsubscribe("A").await;
        assert_eq!(c.next().await.status_type(), Some("unsubscribed"));
        assert_eq!(c.upstream.closed(), 0);

        c.upstream.emit(
            "/pods",
            Ok(WatchEvent::new(EventKind::Modified, json!({"metadata": {"name": "p"}}))),
        );
        let only = c.next().await;
        assert_eq!(only.kind, MessageType::Data);
        assert_eq!(only.id.as_deref(), Some("B"));
        c.assert_quiet().await;

        c.unsubscribe("B").await;
        assert_eq!(c.next().await.status_type(), Some("unsubscribed"));
        c.closed(1).await;
        assert_eq!(c.upstream.opened(), 1);
        assert_eq!(c.conn.registry().lock().await.watch_count(), 0);
        c.assert_quiet().await;
    }

    #[tokio::test]
    async fn inline_fields_join_the_projected_watch() {
        let mut c = Client::open().await;
        c.next().await;
        c.subscribe("1", "/pods?fields=metadata.name").await;
        c.send(json!({"id": "2", "action": "subscribe", "path": "/pods", "params": {"fields": "metadata.name"}}))
            .await;
        c.next().await;
        c.next().await;
        c.opened(1).await;
        {
            let registry = c.conn.registry().lock().await;
            assert_eq!(registry.watch_count(), 1);
            assert_eq!(registry.key_of("1"), Some("/pods?fields=metadata.name"));
            assert_eq!(registry.key_of("1"), registry.key_of("2"));
        }

        c.upstream.emit(
            "/pods",
            Ok(WatchEvent::new(EventKind::Added, json!({"metadata": {"name": "p"}, "spec": {"x": 1}}))),
        );
        for _ in 0..2 {
            let data = c.next().await.data.unwrap();
            assert_eq!(data["object"]["metadata"]["name"], "p");
            assert!(data["object"].get("spec").is_none());
        }

        c.subscribe("3", "/pods").await;
        c.next().await;
        c.opened(2).await;
        assert_eq!(c.conn.registry().lock().await.watch_count(), 2);
    }

    #[tokio::test]
    async fn different_field_sets_are_not_merged() {
        let mut c = Client::open().await;
        c.next().await;
        c.send(json!({"id": "1", "action": "subscribe", "path": "/pods", "params": {"fields": "status"}}))
            .await;
        c.send(json!({"id": "2", "action": "subscribe", "path": "/pods", "params": {"fields": "spec"}}))
            .await;
        c.subscribe("3", "/pods").await;
        c.opened(3).await;
        assert_eq!(c.conn.registry().lock().await.watch_count(), 3);
    }

    #[tokio::test]
    async fn resubscribing_an_id_moves_it() {
        let mut c = Client::open().await;
        c.next().await;
        c.subscribe("1", "/pods").await;
        c.next().await;
        c.opened(1).await;

        c.subscribe("1", "/nodes").await;
        let ack = c.next().await;
        assert_eq!(ack.path.as_deref(), Some("/nodes"));
        c.opened(2).await;
        c.closed(1).await;

        let registry = c.conn.registry().lock().await;
        assert_eq!(registry.key_of("1"), Some("/nodes"));
        assert_eq!(registry.watch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_unsubscribe_is_an_error() {
        let mut c = Client::open().await;
        c.next().await;
        c.unsubscribe("ghost").await;
        let msg = c.next().await;
        assert_eq!(msg.kind, MessageType::Error);
        assert_eq!(msg.id.as_deref(), Some("ghost"));
        assert_eq!(msg.error.as_deref(), Some(NOT_SUBSCRIBED));
        assert_eq!(c.conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn path_only_unsubscribe_releases_every_id() {
        let mut c = Client::open().await;
        c.next().await;
        c.subscribe("1", "/pods").await;
        c.subscribe("2", "/pods").await;
        c.next().await;
        c.next().await;
        c.opened(1).await;

        c.send(json!({"action": "unsubscribe", "path": "/pods"})).await;
        let mut acked = vec![c.next().await.id.unwrap(), c.next().await.id.unwrap()];
        acked.sort();
        assert_eq!(acked, vec!["1", "2"]);
        c.closed(1).await;
    }

    #[tokio::test]
    async fn malformed_frames_do_not_close_the_connection() {
        let mut c = Client::open().await;
        c.next().await;
        c.conn.handle_text("not json").await;
        assert_eq!(c.next().await.kind, MessageType::Error);
        c.send(json!({"id": "1", "action": "subscribe"})).await;
        let msg = c.next().await;
        assert_eq!(msg.id.as_deref(), Some("1"));
        assert_eq!(msg.error.as_deref(), Some("missing path"));

        c.subscribe("1", "/pods").await;
        assert_eq!(c.next().await.status_type(), Some("subscribed"));
    }

    #[tokio::test]
    async fn close_cancels_every_watch() {
        let mut c = Client::open().await;
        c.next().await;
        c.subscribe("1", "/pods").await;
        c.subscribe("2", "/nodes").await;
        c.opened(2).await;

        c.conn.close().await;
        assert_eq!(c.conn.state(), ConnectionState::Closed);
        assert_eq!(c.upstream.closed.load(Ordering::SeqCst), 2);
        let registry = c.conn.registry().lock().await;
        assert_eq!(registry.watch_count(), 0);
        assert_eq!(registry.subscription_count(), 0);
    }
}
