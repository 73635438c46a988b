//! Parent-side event bus that tunnelled events and messages are re-emitted on.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Event {
        recipient: Option<Value>,
        name: String,
        data: Value,
        origin: Option<String>,
    },
    Message {
        recipient: Option<Value>,
        message: String,
        args: Value,
        origin: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn publish_event(&self, recipient: Option<Value>, name: &str, data: Value, origin: Option<&str>);

    fn publish_message(
        &self,
        recipient: Option<Value>,
        message: &str,
        args: Value,
        origin: Option<&str>,
    );
}

/// Fan-out bus; publishing with no subscribers is not an error.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEventBus {
    fn publish_event(&self, recipient: Option<Value>, name: &str, data: Value, origin: Option<&str>) {
        let _ = self.sender.send(BusEvent::Event {
            recipient,
            name: name.to_string(),
            data,
            origin: origin.map(str::to_string),
        });
    }

    fn publish_message(
        &self,
        recipient: Option<Value>,
        message: &str,
        args: Value,
        origin: Option<&str>,
    ) {
        let _ = self.sender.send(BusEvent::Message {
            recipient,
            message: message.to_string(),
            args,
            origin: origin.map(str::to_string),
        });
    }
}
