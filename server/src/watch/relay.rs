//! Watch relays: one task per composite key.
//!
//! A relay owns its upstream source (a cluster watch stream, or a Helm poll
//! loop) and fans every event out to the ids currently mapped to its key.
//! The id set is re-read from the registry for every event, so ids added or
//! removed while the relay runs are picked up without restarting it.
//!
//! Delivery never blocks the registry: a relay first reserves a slot on the
//! outbound channel, then takes the registry lock only to confirm the id is
//! still live and push the frame. A frame is therefore enqueued either before
//! an unsubscribe is processed or not at all.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::poll::{diff, PollTarget};
use super::registry::Registry;
use crate::config::WatchConfig;
use crate::projection::project;
use crate::protocol::ServerMessage;
use crate::stats::Counters;
use crate::upstream::{EventKind, ResourcePath, Upstream};
use crate::ws::Outbound;

/// Relay tuning, taken from `[watch]`.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub poll_failure_limit: u32,
    pub rewatch_delay: Duration,
}

impl From<&WatchConfig> for RelaySettings {
    fn from(config: &WatchConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            poll_failure_limit: config.poll_failure_limit.max(1),
            rewatch_delay: config.rewatch_delay(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

/// Everything one relay task needs.
pub struct Relay {
    pub key: String,
    pub path: ResourcePath,
    pub fields: Vec<String>,
    pub generation: u64,
    pub cancel: CancellationToken,
    pub registry: Arc<Mutex<Registry>>,
    pub outbound: mpsc::Sender<Outbound>,
    pub counters: Arc<Counters>,
    pub upstream: Arc<dyn Upstream>,
    pub settings: RelaySettings,
}

impl Relay {
    /// Start the relay on the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            match PollTarget::parse(&self.path) {
                Some(target) => self.run_poll(target).await,
                None => self.run_direct().await,
            }
            debug!(key = %self.key, "Relay: stopped");
        })
    }

    /// Relay a cluster watch. The cluster ends watches on its own request
    /// timeout, so a clean end re-opens the watch after `rewatch_delay`;
    /// only errors tear the registration down.
    async fn run_direct(&self) {
        let mut reopening = false;
        loop {
            if reopening {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = tokio::time::sleep(self.settings.rewatch_delay) => {}
                }
            }
            info!(key = %self.key, reopening, "Relay: opening watch");
            let opened = tokio::select! {
                () = self.cancel.cancelled() => return,
                opened = self.upstream.watch(&self.path) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => return self.fail(e.to_string()).await,
            };

            loop {
                let next = tokio::select! {
                    () = self.cancel.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) if event.kind == EventKind::Error => {
                        return self.fail(event.error_message()).await;
                    }
                    Some(Ok(event)) => {
                        if !self.deliver(event.into_value()).await {
                            return;
                        }
                    }
                    Some(Err(e)) => return self.fail(e.to_string()).await,
                    None => break,
                }
            }
            debug!(key = %self.key, "Relay: watch ended upstream");
            reopening = true;
        }
    }

    async fn run_poll(&self, target: PollTarget) {
        info!(key = %self.key, "Relay: polling {}", target.source());
        let source = target.source();
        let mut baseline: Vec<Value> = Vec::new();
        let mut failures = 0u32;
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let polled = tokio::select! {
                () = self.cancel.cancelled() => return,
                polled = self.upstream.snapshot(&source) => polled,
            };
            match polled {
                Ok(listing) => {
                    failures = 0;
                    let current = target.items(&listing);
                    for event in diff(&baseline, &current, |item| target.identity(item)) {
                        if !self.deliver(event.into_value()).await {
                            return;
                        }
                    }
                    baseline = current;
                }
                Err(e) => {
                    failures += 1;
                    warn!(key = %self.key, failures, "Relay: poll failed: {e}");
                    if failures >= self.settings.poll_failure_limit {
                        return self.fail(format!("poll failed {failures} times: {e}")).await;
                    }
                }
            }
        }
    }

    /// Project `event` once and enqueue it for every live id. Returns `false`
    /// once the relay should stop (cancelled, or the connection is gone).
    async fn deliver(&self, event: Value) -> bool {
        let (projected, removed) = project(&event, &self.fields);
        let ids = self.registry.lock().await.ids_for(&self.key);
        let path = self.path.to_string();

        for id in ids {
            let permit = tokio::select! {
                () = self.cancel.cancelled() => return false,
                permit = self.outbound.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return false,
                },
            };
            let registry = self.registry.lock().await;
            if self.cancel.is_cancelled() {
                return false;
            }
            if !registry.is_live(&id, &self.key, self.generation) {
                continue;
            }
            permit.send(Outbound::Message(ServerMessage::data(
                &id,
                &path,
                projected.clone(),
            )));
            drop(registry);
            self.counters.record_object(removed);
        }
        true
    }

    /// Report `reason` to every mapped id and remove this relay's
    /// registration. No-op if the relay was cancelled first.
    async fn fail(&self, reason: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        let ids = self
            .registry
            .lock()
            .await
            .remove_failed(&self.key, self.generation);
        warn!(key = %self.key, subscribers = ids.len(), "Relay: upstream failed: {reason}");

        let path = self.path.to_string();
        for id in ids {
            let msg = ServerMessage::error(Some(&id), Some(&path), reason.clone());
            if self.outbound.send(Outbound::Message(msg)).await.is_err() {
                break;
            }
        }
    }
}
