//! Self-healing connection with subscription restore.
//!
//! `Disconnected → Connecting → AwaitingReady → Active`, and back to
//! `Disconnected` on any close. The id → callback map survives every
//! reconnect untouched; entering `Active` re-sends a `subscribe` for each
//! id in it. Subscribe calls made while not `Active` are only recorded and
//! go out with that restore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, MessageType, ServerMessage};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Invoked with every frame addressed to a subscription id.
pub type Callback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    AwaitingReady,
    Active,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("subscription id and path must not be empty")]
    InvalidSubscription,
    #[error("client has shut down")]
    Closed,
}

/// Reconnect timing.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// First delay, and the floor the backoff returns to.
    pub initial: Duration,
    /// Ceiling for the doubling delay.
    pub max: Duration,
    /// Consecutive failed attempts after which the delay drops back to
    /// `initial`.
    pub reset_after: u32,
    /// How long an open socket may go without `ready` before it is dropped.
    pub ready_timeout: Duration,
    /// How long an `Active` socket may go without any inbound frame. The
    /// server sends `stats` every second and pings every 30s, so silence
    /// this long means a half-open link.
    pub idle_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            reset_after: 10,
            ready_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Exponential backoff that never gives up.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delay: policy.initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempts >= self.policy.reset_after.max(1) {
            self.reset();
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.policy.max);
        self.attempts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.policy.initial;
    }
}

struct Subscription {
    path: String,
    params: Option<Map<String, Value>>,
    callback: Callback,
    /// Bumped on every (re)subscribe so a session can tell whether the
    /// server already has the latest version.
    revision: u64,
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

struct Shared {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    state: watch::Sender<ClientState>,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Handle to a background connection task. Dropping it (or calling
/// [`DashboardClient::shutdown`]) stops reconnecting.
pub struct DashboardClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    next_revision: AtomicU64,
    task: JoinHandle<()>,
}

impl DashboardClient {
    /// Start connecting to `url` (e.g. `ws://host:9090/api/ws`) in the
    /// background. Must be called from within a Tokio runtime.
    pub fn connect(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(HashMap::new()),
            state,
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(url.into(), policy, Arc::clone(&shared), rx));
        Self {
            shared,
            commands,
            next_revision: AtomicU64::new(1),
            task,
        }
    }

    /// Record a subscription and send it as soon as the connection is
    /// `Active`. Re-using an id replaces its path and callback.
    pub async fn subscribe<F>(
        &self,
        id: &str,
        path: &str,
        params: Option<Map<String, Value>>,
        callback: F,
    ) -> Result<(), ClientError>
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        if id.is_empty() || path.is_empty() {
            return Err(ClientError::InvalidSubscription);
        }
        let revision = self.next_revision.fetch_add(1, Ordering::Relaxed);
        self.shared.subscriptions.lock().await.insert(
            id.to_string(),
            Subscription {
                path: path.to_string(),
                params,
                callback: Arc::new(callback),
                revision,
            },
        );
        self.commands
            .send(Command::Subscribe(id.to_string()))
            .map_err(|_| ClientError::Closed)
    }

    /// Forget `id`. Returns `false` if it was not subscribed.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool, ClientError> {
        if self.shared.subscriptions.lock().await.remove(id).is_none() {
            return Ok(false);
        }
        self.commands
            .send(Command::Unsubscribe(id.to_string()))
            .map_err(|_| ClientError::Closed)?;
        Ok(true)
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Ids currently recorded, sorted.
    pub async fn subscription_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.subscriptions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop reconnecting and drop the connection.
    pub async fn shutdown(self) {
        let Self {
            shared,
            commands,
            task,
            ..
        } = self;
        drop(commands);
        let abort = task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .is_err()
        {
            debug!("Reconnect: task did not stop, aborting it");
            abort.abort();
        }
        shared.set_state(ClientState::Disconnected);
    }
}

enum SessionEnd {
    /// Lost the connection after reaching `Active`.
    WasActive,
    /// Lost the connection before the server said `ready`.
    Failed,
    /// Every client handle is gone.
    Shutdown,
}

async fn run(
    url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut backoff = Backoff::new(policy);
    loop {
        shared.set_state(ClientState::Connecting);
        let connected = tokio::select! {
            res = tokio_tungstenite::connect_async(url.as_str()) => Some(res),
            () = wait_for_shutdown(&mut commands) => None,
        };
        let end = match connected {
            None => SessionEnd::Shutdown,
            Some(Ok((ws, _))) => run_session(ws, &policy, &shared, &mut commands).await,
            Some(Err(e)) => {
                warn!("Reconnect: connect to {url} failed: {e}");
                SessionEnd::Failed
            }
        };
        shared.set_state(ClientState::Disconnected);

        match end {
            SessionEnd::Shutdown => {
                info!("Reconnect: client shut down");
                return;
            }
            SessionEnd::WasActive => backoff.reset(),
            SessionEnd::Failed => {}
        }

        let delay = backoff.next_delay();
        info!("Reconnect: retrying in {}ms", delay.as_millis());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = wait_for_shutdown(&mut commands) => {
                info!("Reconnect: client shut down");
                return;
            }
        }
    }
}

/// Drain commands until the channel closes. While disconnected they carry
/// nothing the next restore won't already send.
async fn wait_for_shutdown(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while commands.recv().await.is_some() {}
}

async fn run_session(
    ws: WsStream,
    policy: &ReconnectPolicy,
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    shared.set_state(ClientState::AwaitingReady);

    // id → revision the server has from this session.
    let mut sent: HashMap<String, u64> = HashMap::new();
    let mut active = false;
    let lost = |active: bool| {
        if active {
            SessionEnd::WasActive
        } else {
            SessionEnd::Failed
        }
    };

    let mut deadline = Instant::now() + policy.ready_timeout;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                if active {
                    warn!("Reconnect: no frames for {:?}, dropping connection", policy.idle_timeout);
                } else {
                    warn!("Reconnect: server did not send ready within {:?}", policy.ready_timeout);
                }
                return lost(active);
            }
            msg = stream.next() => {
                if active {
                    deadline = Instant::now() + policy.idle_timeout;
                }
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!("Reconnect: ignoring malformed frame: {e}");
                                continue;
                            }
                        };
                        if parsed.kind == MessageType::Ready {
                            if !active {
                                active = true;
                                deadline = Instant::now() + policy.idle_timeout;
                                shared.set_state(ClientState::Active);
                                let frames = restore_frames(shared, &mut sent).await;
                                info!("Reconnect: active, restoring {} subscription(s)", frames.len());
                                for frame in frames {
                                    if send_frame(&mut sink, &frame).await.is_err() {
                                        return lost(active);
                                    }
                                }
                            }
                            continue;
                        }
                        if active {
                            dispatch(shared, &parsed).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Reconnect: connection closed");
                        return lost(active);
                    }
                    Some(Err(e)) => {
                        warn!("Reconnect: connection error: {e}");
                        return lost(active);
                    }
                    Some(Ok(_)) => {}
                }
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                };
                if !active {
                    // Picked up by the restore on `ready`.
                    continue;
                }
                let frame = match cmd {
                    Command::Subscribe(id) => {
                        let subs = shared.subscriptions.lock().await;
                        match subs.get(&id) {
                            Some(sub) if sent.get(&id) != Some(&sub.revision) => {
                                sent.insert(id.clone(), sub.revision);
                                Some(ClientMessage::subscribe(&id, &sub.path, sub.params.clone()))
                            }
                            _ => None,
                        }
                    }
                    Command::Unsubscribe(id) => {
                        let still_wanted = shared.subscriptions.lock().await.contains_key(&id);
                        if !still_wanted && sent.remove(&id).is_some() {
                            Some(ClientMessage::unsubscribe(&id))
                        } else {
                            None
                        }
                    }
                };
                if let Some(frame) = frame {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        return lost(active);
                    }
                }
            }
        }
    }
}

/// Subscribe frames for every recorded id, marking them sent.
async fn restore_frames(shared: &Shared, sent: &mut HashMap<String, u64>) -> Vec<ClientMessage> {
    let subs = shared.subscriptions.lock().await;
    subs.iter()
        .map(|(id, sub)| {
            sent.insert(id.clone(), sub.revision);
            ClientMessage::subscribe(id, &sub.path, sub.params.clone())
        })
        .collect()
}

async fn dispatch(shared: &Shared, msg: &ServerMessage) {
    let Some(id) = msg.id.as_deref() else {
        debug!("Reconnect: {:?} frame without id", msg.kind);
        return;
    };
    let callback = shared
        .subscriptions
        .lock()
        .await
        .get(id)
        .map(|sub| Arc::clone(&sub.callback));
    match callback {
        Some(callback) => callback(msg),
        None => debug!("Reconnect: frame for unknown id {id}"),
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientMessage) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            ..ReconnectPolicy::default()
        }
    }

    type ServerWs = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn send_json(ws: &mut ServerWs, value: serde_json::Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Read text frames until `n` arrive; returns their parsed values.
    async fn read_frames(ws: &mut ServerWs, n: usize) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while frames.len() < n {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("closed")
                .unwrap();
            if let Message::Text(text) = msg {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }
        frames
    }

    /// No further text frame within a short window.
    async fn assert_quiet(ws: &mut ServerWs) {
        let res = tokio::time::timeout(Duration::from_millis(150), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some(text),
                    Some(Ok(_)) => {}
                    _ => return None,
                }
            }
        })
        .await;
        if let Ok(Some(text)) = res {
            panic!("unexpected frame {text}");
        }
    }

    fn sorted_ids(frames: &[serde_json::Value], action: &str) -> Vec<String> {
        let mut ids: Vec<String> = frames
            .iter()
            .filter(|f| f["action"] == action)
            .map(|f| f["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    }

    async fn wait_state(client: &DashboardClient, target: ClientState) {
        let mut rx = client.state_changes();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[test]
    fn backoff_doubles_to_ceiling_then_resets() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            reset_after: 8,
            ..ReconnectPolicy::default()
        });
        let secs: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30, 1, 2]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reconnect_restores_every_subscription_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let client = DashboardClient::connect(url, fast_policy());

        // Recorded before the server is even accepting: sent on Active.
        for id in ["A", "B", "C"] {
            client.subscribe(id, "/pods", None, |_| {}).await.unwrap();
        }
        assert_ne!(client.state(), ClientState::Active);

        let mut first = accept(&listener).await;
        send_json(&mut first, json!({"type": "ready"})).await;
        let frames = read_frames(&mut first, 3).await;
        assert_eq!(sorted_ids(&frames, "subscribe"), vec!["A", "B", "C"]);
        assert_quiet(&mut first).await;
        assert_eq!(client.state(), ClientState::Active);

        drop(first);
        let mut second = accept(&listener).await;
        send_json(&mut second, json!({"type": "ready"})).await;
        let frames = read_frames(&mut second, 3).await;
        assert_eq!(sorted_ids(&frames, "subscribe"), vec!["A", "B", "C"]);
        assert_quiet(&mut second).await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribed_ids_are_not_restored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let client = DashboardClient::connect(url, fast_policy());

        let mut first = accept(&listener).await;
        send_json(&mut first, json!({"type": "ready"})).await;
        wait_state(&client, ClientState::Active).await;

        client.subscribe("A", "/pods", None, |_| {}).await.unwrap();
        client.subscribe("B", "/nodes", None, |_| {}).await.unwrap();
        read_frames(&mut first, 2).await;
        assert!(client.unsubscribe("A").await.unwrap());
        let frames = read_frames(&mut first, 1).await;
        assert_eq!(frames[0], json!({"id": "A", "action": "unsubscribe"}));
        assert!(!client.unsubscribe("A").await.unwrap());

        drop(first);
        wait_state(&client, ClientState::Disconnected).await;
        let mut second = accept(&listener).await;
        send_json(&mut second, json!({"type": "ready"})).await;
        let frames = read_frames(&mut second, 1).await;
        assert_eq!(frames[0]["id"], "B");
        assert_eq!(frames[0]["path"], "/nodes");
        assert_quiet(&mut second).await;

        client.shutdown().await;
    }

    #[tokio::test]
    async fn frames_reach_the_subscription_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let client = DashboardClient::connect(url, fast_policy());

        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client
            .subscribe("A", "/pods", None, move |msg| {
                sink.lock().unwrap().push(msg.clone());
            })
            .await
            .unwrap();

        let mut ws = accept(&listener).await;
        send_json(&mut ws, json!({"type": "ready"})).await;
        read_frames(&mut ws, 1).await;
        send_json(&mut ws, json!({"type": "stats", "data": {"objects_sent": 0}})).await;
        send_json(
            &mut ws,
            json!({"id": "A", "type": "data", "path": "/pods", "data": {"type": "ADDED", "object": {}}}),
        )
        .await;

        for _ in 0..200 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let got = received.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, MessageType::Data);
        assert_eq!(got[0].data.as_ref().unwrap()["type"], "ADDED");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn silent_server_is_dropped_and_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let policy = ReconnectPolicy {
            ready_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(150),
            ..fast_policy()
        };
        let client = DashboardClient::connect(url, policy);
        client.subscribe("A", "/pods", None, |_| {}).await.unwrap();

        // Upgrade accepted, `ready` never sent.
        let mut mute = accept(&listener).await;
        let mut next = accept(&listener).await;
        assert_ne!(client.state(), ClientState::Active);

        // Goes quiet after `ready`: dropped once the idle window passes.
        send_json(&mut next, json!({"type": "ready"})).await;
        read_frames(&mut next, 1).await;
        wait_state(&client, ClientState::Active).await;
        let mut last = accept(&listener).await;
        send_json(&mut last, json!({"type": "ready"})).await;
        let frames = read_frames(&mut last, 1).await;
        assert_eq!(frames[0]["id"], "A");

        let _ = mute.close(None).await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn keeps_retrying_while_server_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DashboardClient::connect(format!("ws://{addr}"), fast_policy());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_ne!(client.state(), ClientState::Active);

        let listener = TcpListener::bind(addr).await.unwrap();
        let mut ws = accept(&listener).await;
        send_json(&mut ws, json!({"type": "ready"})).await;
        wait_state(&client, ClientState::Active).await;

        client.shutdown().await;
    }
}
