use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const IDENTIFIER_PREFIX: &str = "task_";

pub const COMPLETION_KIND: &str = "timer-completion";
pub const OPEN_ACTION: &str = "open";

/// Stable identifier for a task's device notification. Deriving it from the
/// task id means there can only ever be one outstanding handle per task.
pub fn notification_identifier(task_id: &str) -> String {
    format!("{IDENTIFIER_PREFIX}{task_id}")
}

/// Inverse of [`notification_identifier`]; plain ids are returned unchanged.
pub fn task_id_from_identifier(identifier: &str) -> &str {
    identifier
        .strip_prefix(IDENTIFIER_PREFIX)
        .unwrap_or(identifier)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub reschedule_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub data: NotificationData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationHandle {
    pub identifier: String,
    /// `None` fires immediately.
    pub trigger_at: Option<DateTime<Utc>>,
    pub payload: NotificationPayload,
}

impl NotificationHandle {
    pub fn task_id(&self) -> &str {
        &self.payload.data.task_id
    }

    pub fn is_immediate(&self) -> bool {
        self.trigger_at.is_none()
    }
}

/// A notification the delivery service has already put in front of the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredNotification {
    pub identifier: String,
    pub task_id: String,
    pub delivered_at: DateTime<Utc>,
    /// Sent with no trigger, i.e. by the background expiry path.
    pub immediate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_round_trips_through_task_id() {
        let identifier = notification_identifier("abc");
        assert_eq!(identifier, "task_abc");
        assert_eq!(task_id_from_identifier(&identifier), "abc");
        assert_eq!(task_id_from_identifier("abc"), "abc");
    }
}
