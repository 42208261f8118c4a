use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Sent,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Sent => "sent",
        }
    }
}

/// Last processing mark for a task. One per task id; newer marks overwrite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: LedgerStatus,
    pub source: Option<String>,
}

impl LedgerEntry {
    pub fn sent(task_id: impl Into<String>, timestamp: DateTime<Utc>, source: Option<&str>) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp,
            status: LedgerStatus::Sent,
            source: source.map(str::to_string),
        }
    }

    /// Younger than `window` at `now`. Entries stamped in the future count as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.timestamp) < window
    }
}
