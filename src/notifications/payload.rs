use chrono::{DateTime, Utc};

use crate::models::{
    notification_identifier, NotificationData, NotificationHandle, NotificationPayload, Task,
    COMPLETION_KIND, OPEN_ACTION,
};

/// `1st`, `2nd`, `3rd`, `4th`, … with `11th`–`13th` handled.
pub fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

pub fn completion_payload(task: &Task, now: DateTime<Utc>) -> NotificationPayload {
    let (title, body) = if task.reschedule_count == 0 {
        (
            "Time's Up!".to_string(),
            format!("Time to check in on \"{}\"", task.text),
        )
    } else {
        (
            "Task Rescheduled".to_string(),
            format!(
                "\"{}\" is due again, rescheduled for the {} time",
                task.text,
                ordinal(task.reschedule_count)
            ),
        )
    };

    NotificationPayload {
        title,
        body,
        data: NotificationData {
            task_id: task.id.clone(),
            kind: COMPLETION_KIND.to_string(),
            action: OPEN_ACTION.to_string(),
            reschedule_count: task.reschedule_count,
            timestamp: now,
        },
    }
}

/// `trigger_at = None` delivers immediately.
pub fn completion_handle(
    task: &Task,
    trigger_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> NotificationHandle {
    NotificationHandle {
        identifier: notification_identifier(&task.id),
        trigger_at,
        payload: completion_payload(task, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    #[test]
    fn ordinals_use_english_suffixes() {
        let cases = [
            (1, "1st"),
            (2, "2nd"),
            (3, "3rd"),
            (4, "4th"),
            (11, "11th"),
            (12, "12th"),
            (13, "13th"),
            (21, "21st"),
            (102, "102nd"),
            (111, "111th"),
        ];
        for (n, expected) in cases {
            assert_eq!(ordinal(n), expected);
        }
    }

    #[test]
    fn title_depends_on_reschedule_count() {
        let now = Utc::now();
        let mut task = Task::new("u1", "call mom", Priority::High, 5).with_id("t1");
        assert_eq!(completion_payload(&task, now).title, "Time's Up!");

        task.reschedule_count = 2;
        let payload = completion_payload(&task, now);
        assert_eq!(payload.title, "Task Rescheduled");
        assert!(payload.body.contains("2nd"));
    }

    #[test]
    fn payload_data_matches_contract() {
        let now = Utc::now();
        let task = Task::new("u1", "call mom", Priority::High, 5).with_id("t1");
        let handle = completion_handle(&task, None, now);
        let value = serde_json::to_value(&handle.payload.data).unwrap();

        assert_eq!(handle.identifier, "task_t1");
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["type"], "timer-completion");
        assert_eq!(value["action"], "open");
        assert_eq!(value["rescheduleCount"], 0);
        assert!(handle.is_immediate());
    }
}
