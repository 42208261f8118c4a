use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::models::{Priority, Task};
use crate::priority::config::PriorityConfig;

/// Score one task. Pure: the same task, clock and active id always give the
/// same number.
pub fn score(
    task: &Task,
    now: DateTime<Utc>,
    active_task_id: Option<&str>,
    config: &PriorityConfig,
) -> f64 {
    let base = match task.priority {
        Priority::Urgent => config.base_urgent,
        Priority::High => config.base_high,
        Priority::Medium => config.base_medium,
        Priority::Lowest => config.base_lowest,
    };

    let subtasks = (task.open_subtasks() as f64 * config.subtask_bonus).min(config.subtask_bonus_cap);
    let penalty = (f64::from(task.reschedule_count) * config.reschedule_penalty)
        .min(config.reschedule_penalty_cap);

    base + due_bonus(task.effective_due(), now, config) + subtasks - penalty
        + active_bonus(task, active_task_id, config)
}

/// Full bonus when due today or overdue, decaying with whole days left.
fn due_bonus(due: Option<DateTime<Utc>>, now: DateTime<Utc>, config: &PriorityConfig) -> f64 {
    let Some(due) = due else {
        return 0.0;
    };

    let days = (due.date_naive() - now.date_naive()).num_days();
    if days <= 0 {
        config.due_bonus
    } else {
        config.due_bonus / (1.0 + days as f64)
    }
}

/// Only the slot holder counts; a stale `isActive` flag on a record does not.
fn active_bonus(task: &Task, active_task_id: Option<&str>, config: &PriorityConfig) -> f64 {
    if active_task_id == Some(task.id.as_str()) {
        config.active_bonus
    } else {
        0.0
    }
}

/// The single non-completed task that should own the timer and notification
/// slot. Ties go to the earlier due date (undated last), then to the smaller id.
pub fn select<'a>(
    tasks: &'a [Task],
    now: DateTime<Utc>,
    active_task_id: Option<&str>,
    config: &PriorityConfig,
) -> Option<&'a Task> {
    tasks
        .iter()
        .filter(|task| !task.completed)
        .map(|task| (score(task, now, active_task_id, config), task))
        .max_by(|(score_a, a), (score_b, b)| {
            score_a
                .total_cmp(score_b)
                .then_with(|| earlier_due_wins(a, b))
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|(_, task)| task)
}

/// `Greater` when `a` should win the tie.
fn earlier_due_wins(a: &Task, b: &Task) -> Ordering {
    match (a.effective_due(), b.effective_due()) {
        (Some(due_a), Some(due_b)) => due_b.cmp(&due_a),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Subtask;
    use chrono::Duration;

    fn task(id: &str, priority: Priority) -> Task {
        Task::new("u1", id, priority, 5).with_id(id)
    }

    #[test]
    fn overdue_urgent_beats_undated_high() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let mut tasks = vec![
            task("high", Priority::High),
            task("urgent", Priority::Urgent).with_due_date(now - Duration::minutes(5)),
        ];

        assert_eq!(select(&tasks, now, None, &config).unwrap().id, "urgent");

        tasks[1].complete(now);
        assert_eq!(select(&tasks, now, None, &config).unwrap().id, "high");
    }

    #[test]
    fn selection_is_deterministic() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let tasks: Vec<Task> = ["c", "a", "b"]
            .iter()
            .map(|id| task(id, Priority::Medium))
            .collect();

        let first = select(&tasks, now, None, &config).map(|t| t.id.clone());
        for _ in 0..10 {
            assert_eq!(select(&tasks, now, None, &config).map(|t| t.id.clone()), first);
        }
        assert_eq!(first.as_deref(), Some("a"));
    }

    #[test]
    fn due_bonus_decays_with_days() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let today = task("today", Priority::Medium).with_due_date(now);
        let later = task("later", Priority::Medium).with_due_date(now + Duration::days(4));
        let never = task("never", Priority::Medium);

        let today_score = score(&today, now, None, &config);
        let later_score = score(&later, now, None, &config);
        let never_score = score(&never, now, None, &config);

        assert_eq!(today_score, 350.0);
        assert!(later_score > never_score && later_score < today_score);
        assert_eq!(never_score, 200.0);
    }

    #[test]
    fn running_timer_is_sticky() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let tasks = vec![task("a", Priority::High), task("b", Priority::High)];

        assert_eq!(select(&tasks, now, Some("b"), &config).unwrap().id, "b");
    }

    #[test]
    fn active_flag_without_the_slot_earns_nothing() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let mut stale = task("a", Priority::Medium);
        stale.timer_state.begin(now, 5.0);
        let plain = task("b", Priority::Medium);

        assert_eq!(score(&stale, now, None, &config), score(&plain, now, None, &config));
        assert_eq!(select(&[stale, plain], now, Some("b"), &config).unwrap().id, "b");
    }

    #[test]
    fn reschedules_and_subtasks_are_capped() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let mut busy = task("busy", Priority::Medium);
        busy.reschedule_count = 40;
        busy.subtasks = (0..20)
            .map(|i| Subtask {
                id: format!("s{i}"),
                text: "step".into(),
                completed: false,
            })
            .collect();

        assert_eq!(score(&busy, now, None, &config), 200.0 + 25.0 - 50.0);
    }

    #[test]
    fn ties_prefer_earlier_due_date() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        let noon = (now + Duration::days(3))
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        let tasks = vec![
            task("a-undated", Priority::Medium),
            task("b-late", Priority::Medium).with_due_date(noon),
            task("z-early", Priority::Medium).with_due_date(noon - Duration::hours(1)),
        ];

        assert_eq!(select(&tasks, now, None, &config).unwrap().id, "z-early");
        assert_eq!(earlier_due_wins(&tasks[1], &tasks[0]), Ordering::Greater);
    }

    #[test]
    fn empty_or_all_completed_selects_nothing() {
        let now = Utc::now();
        let config = PriorityConfig::default();
        assert!(select(&[], now, None, &config).is_none());

        let mut done = task("done", Priority::Urgent);
        done.complete(now);
        assert!(select(&[done], now, None, &config).is_none());
    }
}
