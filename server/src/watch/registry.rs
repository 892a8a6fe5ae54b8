//! Per-connection subscription registry.
//!
//! Two maps:
//!
//! - `watches`: composite key → [`WatchRegistration`] (one relay each)
//! - `subscriptions`: subscription id → composite key
//!
//! Invariant: a registration exists for a key if and only if at least one id
//! maps to it. Every method here is synchronous and cheap; callers hold the
//! registry lock only for the duration of one call and never across I/O.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::upstream::ResourcePath;

/// One upstream relay, shared by every id mapped to its key.
pub struct WatchRegistration {
    pub path: ResourcePath,
    pub fields: Vec<String>,
    cancel: CancellationToken,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl WatchRegistration {
    fn cancel(&mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.task.take()
    }
}

/// Result of binding an id to a key.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Binding {
    /// The key already had a relay; no upstream work is needed.
    pub joined_existing: bool,
    /// The id previously pointed at this other key, which has now been
    /// released (and torn down if nothing else referenced it).
    pub replaced: Option<String>,
}

/// Result of unbinding an id.
#[derive(Debug, PartialEq, Eq)]
pub struct Release {
    pub key: String,
    pub path: String,
    /// The relay was cancelled because this was the last reference.
    pub torn_down: bool,
}

#[derive(Default)]
pub struct Registry {
    watches: HashMap<String, WatchRegistration>,
    subscriptions: HashMap<String, String>,
    next_generation: u64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.watches.contains_key(key)
    }

    /// Number of live relays.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Number of mapped subscription ids.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn key_of(&self, id: &str) -> Option<&str> {
        self.subscriptions.get(id).map(String::as_str)
    }

    /// Create a registration for `key`. The caller must spawn the relay and
    /// hand its task over with [`Registry::attach_task`].
    ///
    /// Returns the registration's generation, used by the relay to prove it
    /// still owns the key when it later tears itself down.
    pub fn register(
        &mut self,
        key: &str,
        path: ResourcePath,
        fields: Vec<String>,
        cancel: CancellationToken,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(mut old) = self.watches.insert(
            key.to_string(),
            WatchRegistration {
                path,
                fields,
                cancel,
                generation,
                task: None,
            },
        ) {
            old.cancel();
        }
        generation
    }

    pub fn attach_task(&mut self, key: &str, generation: u64, task: JoinHandle<()>) {
        match self.watches.get_mut(key) {
            Some(reg) if reg.generation == generation => reg.task = Some(task),
            // Relay already tore itself down; nothing to track.
            _ => {}
        }
    }

    /// Point `id` at `key`, replacing whatever it pointed at before.
    ///
    /// A replaced key left without references is cancelled and removed.
    pub fn bind(&mut self, id: &str, key: &str) -> Binding {
        let joined_existing = self.watches.contains_key(key);
        let previous = self.subscriptions.insert(id.to_string(), key.to_string());
        let replaced = previous.filter(|old| old != key);
        if let Some(old) = &replaced {
            self.release_if_unreferenced(old);
        }
        Binding {
            joined_existing,
            replaced,
        }
    }

    /// Remove the mapping for `id`. Tears the relay down if `id` was its last
    /// reference. Returns `None` if `id` was not subscribed.
    pub fn unbind(&mut self, id: &str) -> Option<Release> {
        let key = self.subscriptions.remove(id)?;
        let path = self
            .watches
            .get(&key)
            .map_or_else(|| key.clone(), |w| w.path.to_string());
        let torn_down = self.release_if_unreferenced(&key);
        Some(Release {
            key,
            path,
            torn_down,
        })
    }

    /// Ids currently mapped to `key`, for legacy path-only unsubscribes.
    pub fn ids_for(&self, key: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, k)| k.as_str() == key)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether `id` still maps to the relay identified by `key`/`generation`.
    pub fn is_live(&self, id: &str, key: &str, generation: u64) -> bool {
        self.subscriptions.get(id).is_some_and(|k| k == key)
            && self
                .watches
                .get(key)
                .is_some_and(|w| w.generation == generation && !w.cancel.is_cancelled())
    }

    /// Relay-initiated teardown after an upstream failure.
    ///
    /// Removes the registration and every id mapped to it, returning those
    /// ids so the relay can notify them. Does nothing if the key has since
    /// been re-registered under a newer generation.
    pub fn remove_failed(&mut self, key: &str, generation: u64) -> Vec<String> {
        match self.watches.get(key) {
            Some(w) if w.generation == generation => {}
            _ => return Vec::new(),
        }
        if let Some(mut reg) = self.watches.remove(key) {
            // Dropping our own handle detaches the (exiting) task.
            drop(reg.cancel());
        }
        let ids = self.ids_for(key);
        self.subscriptions.retain(|_, k| k != key);
        ids
    }

    /// Cancel every relay and forget every mapping. Returns the relay tasks
    /// so the caller can wait for them to exit.
    pub fn drain(&mut self) -> Vec<JoinHandle<()>> {
        self.subscriptions.clear();
        self.watches
            .drain()
            .filter_map(|(_, mut reg)| reg.cancel())
            .collect()
    }

    fn release_if_unreferenced(&mut self, key: &str) -> bool {
        if self.subscriptions.values().any(|k| k == key) {
            return false;
        }
        match self.watches.remove(key) {
            Some(mut reg) => {
                // The relay observes the token and exits on its own.
                drop(reg.cancel());
                true
            }
            None => false,
        }
    }
}
