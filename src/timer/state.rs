use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp;

use crate::models::Task;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Active,
    Paused,
    Completed,
}

/// Seconds left on a countdown of `duration_minutes` started at `start_time`,
/// measured at `at`. Never negative; a missing start means "just started".
pub fn remaining_secs(
    duration_minutes: f64,
    start_time: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> i64 {
    let total = total_secs(duration_minutes);
    let elapsed = start_time
        .map(|start| at.signed_duration_since(start).num_milliseconds().div_euclid(1000))
        .unwrap_or(0)
        .max(0);
    cmp::max(total - elapsed, 0)
}

pub fn total_secs(duration_minutes: f64) -> i64 {
    if duration_minutes.is_finite() && duration_minutes > 0.0 {
        (duration_minutes * 60.0).round() as i64
    } else {
        0
    }
}

/// `duration*60 − floor((now − startTime)/1s)`, floored at zero.
///
/// Derived purely from the stored start time, so it is correct after a
/// suspension of any length. Paused timers are measured at `pausedAt`,
/// completed timers report zero and idle timers their full duration.
pub fn calculate_remaining(task: &Task, now: DateTime<Utc>) -> i64 {
    let timer = &task.timer_state;
    let duration = if timer.duration > 0.0 {
        timer.duration
    } else {
        f64::from(task.interval)
    };

    if !timer.is_active {
        return if timer.is_completed {
            0
        } else {
            total_secs(duration)
        };
    }

    let at = if timer.is_paused {
        timer.paused_at.unwrap_or(now)
    } else {
        now
    };
    remaining_secs(duration, timer.start_time, at)
}

/// The single in-process countdown slot. Mirrors the record of the task it
/// holds and is always re-derivable from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimerSlot {
    pub status: TimerStatus,
    /// `currentlyTimedTaskId`.
    pub task_id: Option<String>,
    pub duration_minutes: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, task_id: &str) -> bool {
        self.task_id.as_deref() == Some(task_id)
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match self.status {
            TimerStatus::Idle => 0,
            TimerStatus::Completed => 0,
            TimerStatus::Active => remaining_secs(self.duration_minutes, self.start_time, now),
            TimerStatus::Paused => remaining_secs(
                self.duration_minutes,
                self.start_time,
                self.paused_at.unwrap_or(now),
            ),
        }
    }

    /// Mirror the timer sub-state of `task` into the slot.
    pub fn attach(&mut self, task: &Task) {
        let timer = &task.timer_state;
        *self = Self {
            status: if timer.is_paused {
                TimerStatus::Paused
            } else {
                TimerStatus::Active
            },
            task_id: Some(task.id.clone()),
            duration_minutes: timer.duration,
            start_time: timer.start_time,
            paused_at: timer.paused_at,
        };
    }

    pub fn pause(&mut self, now: DateTime<Utc>) {
        self.status = TimerStatus::Paused;
        self.paused_at = Some(now);
    }

    pub fn complete(&mut self) {
        self.status = TimerStatus::Completed;
        self.start_time = None;
        self.paused_at = None;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use chrono::Duration;

    fn active_task(duration: f64, started: DateTime<Utc>) -> Task {
        let mut task = Task::new("u1", "focus", Priority::Urgent, 5).with_id("t1");
        task.timer_state.begin(started, duration);
        task
    }

    #[test]
    fn remaining_is_independent_of_ticks() {
        let t0 = Utc::now();
        let task = active_task(5.0, t0);

        for elapsed in [0, 1, 59, 299, 300, 301, 86_400 * 3] {
            let t1 = t0 + Duration::seconds(elapsed);
            assert_eq!(calculate_remaining(&task, t1), (300 - elapsed).max(0), "after {elapsed}s");
        }
    }

    #[test]
    fn overdue_timer_reports_zero() {
        let now = Utc::now();
        let task = active_task(5.0, now - Duration::seconds(310));
        assert_eq!(calculate_remaining(&task, now), 0);
    }

    #[test]
    fn partial_seconds_are_floored() {
        let t0 = Utc::now();
        let task = active_task(1.0, t0);
        assert_eq!(calculate_remaining(&task, t0 + Duration::milliseconds(1_999)), 59);
    }

    #[test]
    fn paused_timer_stops_at_pause_time() {
        let t0 = Utc::now();
        let mut task = active_task(5.0, t0);
        task.timer_state.pause(t0 + Duration::seconds(100));

        assert_eq!(calculate_remaining(&task, t0 + Duration::hours(2)), 200);
    }

    #[test]
    fn idle_and_completed_timers() {
        let now = Utc::now();
        let mut task = Task::new("u1", "focus", Priority::Urgent, 5);
        assert_eq!(calculate_remaining(&task, now), 300);

        task.timer_state.mark_completed(now, true);
        assert_eq!(calculate_remaining(&task, now), 0);
    }

    #[test]
    fn start_in_the_future_does_not_extend_the_timer() {
        let now = Utc::now();
        let task = active_task(5.0, now + Duration::minutes(10));
        assert_eq!(calculate_remaining(&task, now), 300);
    }

    #[test]
    fn slot_mirrors_record() {
        let now = Utc::now();
        let task = active_task(5.0, now - Duration::seconds(60));
        let mut slot = TimerSlot::new();
        slot.attach(&task);

        assert!(slot.holds("t1"));
        assert_eq!(slot.status, TimerStatus::Active);
        assert_eq!(slot.remaining_secs(now), 240);

        slot.complete();
        assert_eq!(slot.remaining_secs(now), 0);
    }
}
