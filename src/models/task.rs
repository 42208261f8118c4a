//! Task records as the document store holds them.
//!
//! Documents written by older clients are loose: timestamps may be ISO
//! strings, server timestamp objects or epoch millis, booleans may be missing.
//! [`Task::standardize`] is the single entry point that turns such a document
//! into a well-formed [`Task`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

use super::timer_state::{NotificationStatus, TimerState};

pub const DEFAULT_DURATION_MINUTES: f64 = 25.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Lowest,
    Medium,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Lowest => "Lowest",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lowest" | "low" => Some(Priority::Lowest),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub priority: Priority,
    /// Minutes until the reminder fires.
    pub interval: u32,
    #[serde(default)]
    pub intervals: Vec<u32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed: bool,
    pub reschedule_count: u32,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    pub timer_state: TimerState,
    pub notification_id: Option<String>,
    pub next_reminder_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        user_id: impl Into<String>,
        text: impl Into<String>,
        priority: Priority,
        interval: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            text: text.into(),
            priority,
            interval,
            intervals: Vec::new(),
            scheduled_for: None,
            due_date: None,
            completed: false,
            reschedule_count: 0,
            subtasks: Vec::new(),
            timer_state: TimerState {
                duration: f64::from(interval),
                ..TimerState::default()
            },
            notification_id: None,
            next_reminder_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    /// `dueDate` wins over `scheduledFor`.
    pub fn effective_due(&self) -> Option<DateTime<Utc>> {
        self.due_date.or(self.scheduled_for)
    }

    pub fn interval_minutes(&self, default_minutes: f64) -> f64 {
        if self.interval > 0 {
            f64::from(self.interval)
        } else {
            default_minutes
        }
    }

    pub fn open_subtasks(&self) -> usize {
        self.subtasks.iter().filter(|s| !s.completed).count()
    }

    /// Mark the task done. A completed task never holds a timer.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.completed = true;
        self.timer_state.clear();
        self.notification_id = None;
        self.next_reminder_time = None;
        self.updated_at = now;
    }

    /// Re-establish the invariants a writer may have broken.
    pub fn enforce_invariants(&mut self, now: DateTime<Utc>) {
        let timer = &mut self.timer_state;
        if self.completed && timer.is_active {
            timer.clear();
        }
        if timer.is_active && timer.start_time.is_none() {
            timer.start_time = Some(now);
        }
        if !timer.is_active {
            timer.start_time = None;
            timer.is_paused = false;
            timer.paused_at = None;
        }
    }

    /// Build a task from a raw store document, recovering what can be recovered.
    pub fn standardize(raw: &Value, default_duration_minutes: f64) -> CoreResult<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| CoreError::invalid("task document is not an object"))?;

        let id = string_field(obj, "id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CoreError::invalid("task document has no id"))?;

        let now = Utc::now();
        let interval = u32_field(obj, "interval")
            .or_else(|| {
                obj.get("intervals")
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(value_as_u32)
            })
            .unwrap_or(0);
        let intervals = obj
            .get("intervals")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(value_as_u32).collect())
            .unwrap_or_default();

        let fallback_duration = if interval > 0 {
            f64::from(interval)
        } else {
            default_duration_minutes
        };

        let timer_state = obj
            .get("timerState")
            .and_then(Value::as_object)
            .map(|timer| standardize_timer(timer, fallback_duration))
            .unwrap_or_else(|| TimerState {
                duration: fallback_duration,
                ..TimerState::default()
            });

        let subtasks = obj
            .get("subtasks")
            .cloned()
            .and_then(|value| serde_json::from_value::<Vec<Subtask>>(value).ok())
            .unwrap_or_default();

        let mut task = Task {
            id,
            user_id: string_field(obj, "userId").unwrap_or_default(),
            text: string_field(obj, "text").unwrap_or_default(),
            priority: string_field(obj, "priority")
                .and_then(|p| Priority::parse(&p))
                .unwrap_or_default(),
            interval,
            intervals,
            scheduled_for: obj.get("scheduledFor").and_then(parse_timestamp),
            due_date: obj.get("dueDate").and_then(parse_timestamp),
            completed: bool_field(obj, "completed"),
            reschedule_count: u32_field(obj, "rescheduleCount").unwrap_or(0),
            subtasks,
            timer_state,
            notification_id: string_field(obj, "notificationId"),
            next_reminder_time: obj.get("nextReminderTime").and_then(parse_timestamp),
            created_at: obj
                .get("createdAt")
                .and_then(parse_timestamp)
                .unwrap_or(now),
            updated_at: obj
                .get("updatedAt")
                .and_then(parse_timestamp)
                .unwrap_or(now),
        };

        task.enforce_invariants(now);
        Ok(task)
    }
}

fn standardize_timer(timer: &Map<String, Value>, fallback_duration: f64) -> TimerState {
    let duration = timer
        .get("duration")
        .and_then(value_as_f64)
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(fallback_duration);

    TimerState {
        is_active: bool_field(timer, "isActive"),
        is_paused: bool_field(timer, "isPaused"),
        start_time: timer.get("startTime").and_then(parse_timestamp),
        paused_at: timer.get("pausedAt").and_then(parse_timestamp),
        duration,
        is_completed: bool_field(timer, "isCompleted"),
        completed_at: timer.get("completedAt").and_then(parse_timestamp),
        completed_in_foreground: bool_field(timer, "completedInForeground"),
        notification_status: string_field(timer, "notificationStatus")
            .and_then(|s| NotificationStatus::parse(&s))
            .unwrap_or_default(),
        modal_shown: bool_field(timer, "modalShown"),
        background_completed: bool_field(timer, "backgroundCompleted"),
    }
}

/// Accepts RFC 3339 strings, naive ISO strings (read as UTC), server
/// timestamp objects (`{seconds, nanoseconds}` with or without a leading
/// underscore) and epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::Object(obj) => {
            let seconds = obj
                .get("seconds")
                .or_else(|| obj.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            DateTime::from_timestamp(seconds, u32::try_from(nanos).ok()?)
        }
        _ => None,
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn u32_field(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    obj.get(key).and_then(value_as_u32)
}

fn value_as_u32(value: &Value) -> Option<u32> {
    value_as_f64(value)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as u32)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
