use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Scheduled,
    Completed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Scheduled => "scheduled",
            NotificationStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NotificationStatus::Pending),
            "scheduled" => Some(NotificationStatus::Scheduled),
            "completed" => Some(NotificationStatus::Completed),
            _ => None,
        }
    }
}

/// Timer sub-record embedded in every task document.
///
/// `start_time` is set exactly when `is_active` is true. Remaining time is
/// never stored; it is derived from `start_time` and `duration` on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub is_active: bool,
    pub is_paused: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Minutes. Fractional after a resume folds the remaining time back in.
    pub duration: f64,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_in_foreground: bool,
    pub notification_status: NotificationStatus,
    pub modal_shown: bool,
    pub background_completed: bool,
}

impl TimerState {
    /// Counting down right now (active and not paused).
    pub fn is_running(&self) -> bool {
        self.is_active && !self.is_paused
    }

    pub fn begin(&mut self, now: DateTime<Utc>, duration_minutes: f64) {
        *self = Self {
            is_active: true,
            start_time: Some(now),
            duration: duration_minutes,
            ..Self::default()
        };
    }

    pub fn pause(&mut self, now: DateTime<Utc>) {
        self.is_paused = true;
        self.paused_at = Some(now);
        self.notification_status = NotificationStatus::Pending;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>, foreground: bool) {
        self.is_active = false;
        self.is_paused = false;
        self.start_time = None;
        self.paused_at = None;
        self.is_completed = true;
        self.completed_at = Some(now);
        self.completed_in_foreground = foreground;
        self.background_completed = !foreground;
        self.notification_status = NotificationStatus::Completed;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A completed timer the user has not acknowledged yet.
    pub fn awaiting_acknowledgement(&self) -> bool {
        !self.is_active && self.is_completed && !self.modal_shown
    }
}
