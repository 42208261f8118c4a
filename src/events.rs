use serde::Serialize;
use tokio::sync::broadcast;

use crate::timer::TimerSnapshot;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionSource {
    TimerExpiry,
    Reconcile,
    NotificationResponse,
}

impl CompletionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionSource::TimerExpiry => "timer-expiry",
            CompletionSource::Reconcile => "reconcile",
            CompletionSource::NotificationResponse => "notification-response",
        }
    }
}

/// One logical timer completion, published at most once per suppression window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub task_id: String,
    /// Surfaced in-process (prompt shown) rather than through a device notification.
    pub foreground: bool,
    pub source: CompletionSource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    TimerStateChanged(TimerSnapshot),
    TimerHeartbeat(TimerSnapshot),
    Completion(CompletionEvent),
    #[serde(rename_all = "camelCase")]
    TaskGone { task_id: String },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}
