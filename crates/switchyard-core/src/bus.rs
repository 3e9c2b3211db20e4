use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A request was served by a model other than the one the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackUsed {
    pub session_id: String,
    pub original_backend: String,
    pub original_model: String,
    pub fallback_backend: String,
    pub fallback_model: String,
    pub reason: String,
    pub attempt: u32,
}

/// Every attempt for a request failed with a retryable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackExhausted {
    pub session_id: String,
    pub original_backend: String,
    pub original_model: String,
    pub attempted: Vec<String>,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    FallbackUsed(FallbackUsed),
    FallbackExhausted(FallbackExhausted),
}

/// Fan-out bus for resilience notifications.
///
/// Publishing never blocks and never fails the request path: with no
/// subscribers the event is simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size.max(1));
        Self { tx }
    }

    /// Get a receiver that sees every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: ResilienceEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::debug!("No subscribers for resilience event");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
