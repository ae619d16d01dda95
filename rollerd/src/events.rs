//! Event broadcast for roller activity.
//!
//! Subscribers (the HTTP event stream, tests) receive JSON lines; lagging
//! subscribers drop events rather than backpressuring the controller.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

pub const EVENT_STATE_TRANSITION: &str = "state_transition";
pub const EVENT_ROLL_UPLOADED: &str = "roll_uploaded";
pub const EVENT_ROLL_LANDED: &str = "roll_landed";
pub const EVENT_TICK_ERROR: &str = "tick_error";
pub const EVENT_MANUAL_ROLL_STARTED: &str = "manual_roll_started";

/// Broadcast channel for roller events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus. The effective buffer is clamped to at
    /// least `DEFAULT_BUFFER` so bursty transition storms do not lag
    /// subscribers.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1).max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("failed to serialize event {}: {}", event, err),
        }
    }

    /// Emit a state-machine transition.
    pub fn emit_transition(&self, from: &str, to: &str) {
        self.emit(
            EVENT_STATE_TRANSITION,
            &json!({ "from": from, "to": to }),
        );
    }

    /// Emit an uploaded roll.
    pub fn emit_roll_uploaded(&self, issue: i64, url: &str, dry_run: bool) {
        self.emit(
            EVENT_ROLL_UPLOADED,
            &json!({ "issue": issue, "url": url, "dry_run": dry_run }),
        );
    }

    /// Emit a landed roll.
    pub fn emit_roll_landed(&self, issue: i64) {
        self.emit(EVENT_ROLL_LANDED, &json!({ "issue": issue }));
    }
}
