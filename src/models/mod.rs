mod ledger_entry;
mod notification;
mod task;
mod timer_state;

pub use ledger_entry::{LedgerEntry, LedgerStatus};
pub use notification::{
    notification_identifier, task_id_from_identifier, DeliveredNotification, NotificationData,
    NotificationHandle, NotificationPayload, COMPLETION_KIND, OPEN_ACTION,
};
pub use task::{parse_timestamp, Priority, Subtask, Task, DEFAULT_DURATION_MINUTES};
pub use timer_state::{NotificationStatus, TimerState};
