use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

type FlightMap = Arc<Mutex<HashMap<String, watch::Receiver<Option<Value>>>>>;

/// In-flight computation registry: at most one concurrent computation per
/// key. The first caller becomes the leader and computes; every other
/// caller for the same key blocks on the leader's completion and receives
/// the same result.
///
/// Keys are the full `(namespace, version, digest)` cache identity, so a
/// hook-initiated sub-call for a different key can never deadlock on the
/// flight it is nested under.
#[derive(Default)]
pub struct Singleflight {
    inflight: FlightMap,
}

/// Outcome of joining a flight: leaders compute, followers wait.
pub enum Flight {
    Leader(FlightGuard),
    Follower(watch::Receiver<Option<Value>>),
}

/// Held by the leader while computing. [`FlightGuard::publish`] releases
/// every follower with the result; dropping the guard without publishing
/// (leader failed) closes the channel so followers re-join and retry.
pub struct FlightGuard {
    key: String,
    tx: watch::Sender<Option<Value>>,
    inflight: FlightMap,
}

impl Singleflight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, becoming the leader if none is active.
    pub fn join(&self, key: &str) -> Flight {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(rx) = inflight.get(key) {
            debug!("singleflight: waiting on in-flight computation for {}", key);
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            key: key.to_string(),
            tx,
            inflight: Arc::clone(&self.inflight),
        })
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl FlightGuard {
    /// Publish the leader's result to all followers and retire the key.
    pub fn publish(self, value: Value) {
        // Send before the Drop-side removal so a follower holding the
        // receiver can never miss both the map entry and the value.
        let _ = self.tx.send(Some(value));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inflight.remove(&self.key);
    }
}

/// Wait for a flight's published value. Returns `None` when the leader
/// failed without publishing (its guard was dropped); the caller should
/// re-join the flight and may become the new leader.
pub async fn wait(mut rx: watch::Receiver<Option<Value>>) -> Option<Value> {
    loop {
        if let Some(value) = rx.borrow().clone() {
            return Some(value);
        }
        if rx.changed().await.is_err() {
            // Sender dropped; one last borrow in case publish raced the drop.
            return rx.borrow().clone();
        }
    }
}
