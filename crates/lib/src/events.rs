//! Broadcast sink: fire-and-forget notifications to zero or more observers.
//!
//! The orchestrator publishes after persisting, so an observer never sees a
//! state the store doesn't yet have. Delivery is best-effort.

use serde_json::Value;
use tokio::sync::mpsc;

/// Topics published by the orchestrator.
pub mod topics {
    /// A message was appended to a conversation. Payload:
    /// `{conversationId, message}`.
    pub const MESSAGE: &str = "chat:message";
    /// A conversation's status changed. Payload:
    /// `{conversationId, status, reason?}`.
    pub const STATUS: &str = "chat:status";
    /// A conversation's title changed. Payload: `{conversationId, title}`.
    pub const TITLE: &str = "chat:title";
}

/// Fire-and-forget notification sink.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

/// Broadcaster that only logs. Default for headless embedding.
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn publish(&self, topic: &str, payload: Value) {
        log::debug!("broadcast {}: {}", topic, payload);
    }
}

/// One published event, for channel subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

/// Broadcaster that forwards events over an unbounded channel (UI bridge,
/// tests). Dropped receivers are ignored.
pub struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelBroadcaster {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, topic: &str, payload: Value) {
        let _ = self.tx.send(Event {
            topic: topic.to_string(),
            payload,
        });
    }
}
