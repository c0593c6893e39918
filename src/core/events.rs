// src/core/events.rs

//! Defines the per-server event bus: a topic to subscriber fan-out that
//! carries console output, power state changes, and resource telemetry
//! from the supervision engine to websocket sessions.

use crate::core::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Topics published by the supervision engine. The string values double as
/// the websocket `event` field, so they are part of the wire contract.
pub mod topic {
    pub const STATUS: &str = "status";
    pub const CONSOLE_OUTPUT: &str = "console output";
    pub const INSTALL_OUTPUT: &str = "install output";
    pub const INSTALL_STARTED: &str = "install started";
    pub const INSTALL_COMPLETED: &str = "install completed";
    pub const STATS: &str = "stats";
    pub const BACKUP_COMPLETED: &str = "backup completed";
    pub const TRANSFER_STATUS: &str = "transfer status";
    pub const TRANSFER_LOGS: &str = "transfer logs";
    pub const DAEMON_MESSAGE: &str = "daemon message";
    /// Carries anonymized failures from supervised background tasks.
    pub const DAEMON_ERROR: &str = "daemon error";
}

/// The default capacity for a subscriber's sink. High-frequency topics
/// (console, stats) can burst well past this; overflow is dropped for that
/// subscriber rather than back-pressuring the publisher.
pub const DEFAULT_SINK_CAPACITY: usize = 128;

/// A single event on a server's bus. The payload is either a plain string
/// (console lines) or a JSON-encodable structure (stats, status changes).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

impl Event {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
        }
    }

    /// Renders the payload the way the websocket frame carries it: strings
    /// pass through unquoted, anything else is serialized to JSON.
    pub fn payload_string(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// The receiving half handed to a subscriber.
pub type EventReceiver = mpsc::Receiver<Event>;

/// The sending half registered with the bus.
pub type EventSink = mpsc::Sender<Event>;

/// Creates a bounded sink/receiver pair suitable for [`EventBus::subscribe`].
pub fn sink_pair(capacity: usize) -> (EventSink, EventReceiver) {
    mpsc::channel(capacity)
}

/// `EventBus` is the per-server distribution hub. Every server aggregate
/// owns exactly one; the container environment and the filesystem publish
/// into it through a callback so that neither holds the server itself.
///
/// Delivery contract: `publish` never blocks. A subscriber whose sink is
/// full has that event dropped, and delivered events keep their publish
/// order per `(topic, subscriber)` pair.
#[derive(Debug, Default)]
pub struct EventBus {
    /// Topic name to the sinks subscribed to it. The sink list is cloned
    /// before delivery so the lock is never held across a send.
    topics: Mutex<HashMap<String, Vec<EventSink>>>,
    destroyed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `sink` for each of the given topics. Subscribing the same
    /// sink to a topic twice is a no-op.
    pub fn subscribe(&self, sink: EventSink, topics: &[&str]) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut map = self.topics.lock();
        for name in topics {
            let sinks = map.entry(name.to_string()).or_default();
            if !sinks.iter().any(|s| s.same_channel(&sink)) {
                sinks.push(sink.clone());
            }
        }
    }

    /// Removes `sink` from each of the given topics.
    pub fn unsubscribe(&self, sink: &EventSink, topics: &[&str]) {
        let mut map = self.topics.lock();
        for name in topics {
            if let Some(sinks) = map.get_mut(*name) {
                sinks.retain(|s| !s.same_channel(sink));
                if sinks.is_empty() {
                    map.remove(*name);
                }
            }
        }
    }

    /// Removes `sink` from every topic it is subscribed to.
    pub fn unsubscribe_all(&self, sink: &EventSink) {
        let mut map = self.topics.lock();
        map.retain(|_, sinks| {
            sinks.retain(|s| !s.same_channel(sink));
            !sinks.is_empty()
        });
    }

    /// Publishes an event to every subscriber of `topic`.
    ///
    /// A full sink drops the event for that subscriber only; a slow
    /// websocket client must never stall the container attach loop that
    /// feeds this bus.
    pub fn publish(&self, topic: &str, payload: Value) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let sinks = {
            let map = self.topics.lock();
            match map.get(topic) {
                Some(sinks) => sinks.clone(),
                None => return,
            }
        };

        let event = Event::new(topic, payload);
        for sink in sinks {
            match sink.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    metrics::EVENTS_DROPPED_TOTAL
                        .with_label_values(&[topic])
                        .inc();
                    debug!(topic, "subscriber sink full, dropping event");
                }
                // The receiving task is gone; it will be pruned when it
                // unsubscribes or when the bus is destroyed.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Convenience for publishing a bare string payload.
    pub fn publish_str(&self, topic: &str, payload: &str) {
        self.publish(topic, Value::String(payload.to_string()));
    }

    /// Tears the bus down. Every registered sink is dropped, which closes a
    /// subscriber's receiver exactly once even when it was subscribed to
    /// several topics (clones of one channel share a single closure).
    /// Subsequent publishes are no-ops.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.topics.lock().clear();
    }

    /// Number of sinks currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }
}
