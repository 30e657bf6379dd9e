//! Log fan-out: one ring buffer per app (plus one for the daemon's own
//! logs) so a client that subscribes late still gets the last N lines
//! before following the live tail, and a slow subscriber gets dropped
//! rather than stalling the producer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

const RING_CAPACITY: usize = 500;
const CHANNEL_CAPACITY: usize = 256;

/// Channel the daemon's own (non-container) logs are published under.
pub const SERVER_LOG_CHANNEL: &str = "__server__";

/// Wire shape for one line of container log output streamed to a
/// client: one JSON object per line (NDJSON), not raw text.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(rename = "containerID")]
    pub container_id: String,
    pub line: String,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl LogEntry {
    pub fn ndjson(container_id: &str, line: impl Into<String>) -> String {
        let entry = Self { container_id: container_id.to_owned(), line: line.into(), ts: chrono::Utc::now() };
        serde_json::to_string(&entry).unwrap_or_default()
    }
}

struct Ring {
    lines: VecDeque<String>,
    tx: broadcast::Sender<String>,
}

impl Ring {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            lines: VecDeque::with_capacity(RING_CAPACITY),
            tx,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        // A full broadcast channel just means nobody's listening; a
        // send error here is not an error for the producer.
        let _ = self.tx.send(line);
    }
}

#[derive(Clone)]
pub struct LogHub {
    rings: Arc<Mutex<HashMap<String, Ring>>>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            rings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn publish(&self, channel: &str, line: impl Into<String>) {
        let mut rings = self.rings.lock().unwrap();
        rings.entry(channel.to_owned()).or_insert_with(Ring::new).push(line.into());
    }

    /// Returns the backlog plus a receiver that will yield everything
    /// published after this call. The backlog is a point-in-time
    /// snapshot; lines published between taking it and subscribing are
    /// delivered once, via the receiver.
    pub fn subscribe(&self, channel: &str) -> (Vec<String>, broadcast::Receiver<String>) {
        let mut rings = self.rings.lock().unwrap();
        let ring = rings.entry(channel.to_owned()).or_insert_with(Ring::new);
        (ring.lines.iter().cloned().collect(), ring.tx.subscribe())
    }
}

/// A `tracing_subscriber::Layer` that mirrors every event's message
/// into the `SERVER_LOG_CHANNEL` ring, so `/server-logs` streams the
/// daemon's own logs instead of a channel nothing ever publishes to.
pub struct LogHubLayer {
    hub: LogHub,
}

impl LogHubLayer {
    pub fn new(hub: LogHub) -> Self {
        Self { hub }
    }
}

impl<S> tracing_subscriber::Layer<S> for LogHubLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        if visitor.0.is_empty() {
            return;
        }
        self.hub.publish(SERVER_LOG_CHANNEL, format!("{} {}", event.metadata().level(), visitor.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_subscriber_gets_backlog() {
        let hub = LogHub::new();
        hub.publish("web", "line 1");
        hub.publish("web", "line 2");
        let (backlog, _rx) = hub.subscribe("web");
        assert_eq!(backlog, vec!["line 1".to_owned(), "line 2".to_owned()]);
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let hub = LogHub::new();
        for i in 0..(RING_CAPACITY + 10) {
            hub.publish("web", format!("line {i}"));
        }
        let (backlog, _rx) = hub.subscribe("web");
        assert_eq!(backlog.len(), RING_CAPACITY);
        assert_eq!(backlog.first(), Some(&"line 10".to_owned()));
    }
}
