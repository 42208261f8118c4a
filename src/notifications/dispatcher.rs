use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use crate::{
    error::{CoreError, CoreResult},
    events::{CompletionEvent, EngineEvent, EventBus},
    models::{notification_identifier, task_id_from_identifier, NotificationHandle, NotificationStatus, Task},
    store::TaskStore,
};

use super::{delivery::DeliveryService, payload::completion_handle};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The scheduled reminder for this task already reached the user.
    AlreadyPresented,
}

/// Owns the single live scheduled notification. Holds no durable state of
/// its own beyond what it writes onto the task record.
pub struct NotificationDispatcher {
    delivery: Arc<dyn DeliveryService>,
    store: Arc<dyn TaskStore>,
    events: EventBus,
    /// Task whose handle is currently scheduled. Locked for the whole
    /// cancel-then-create sequence so two schedules cannot interleave.
    owner: Mutex<Option<String>>,
    window: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        delivery: Arc<dyn DeliveryService>,
        store: Arc<dyn TaskStore>,
        events: EventBus,
        window: Duration,
    ) -> Self {
        Self {
            delivery,
            store,
            events,
            owner: Mutex::new(None),
            window,
        }
    }

    pub async fn owner(&self) -> Option<String> {
        self.owner.lock().await.clone()
    }

    /// Schedule the completion reminder `remaining_secs` from now.
    ///
    /// Any previous owner's handle and any handle for this task are cancelled
    /// first, so at most one scheduled handle exists system-wide.
    pub async fn schedule_completion(
        &self,
        task: &Task,
        remaining_secs: i64,
    ) -> CoreResult<NotificationHandle> {
        let mut owner = self.owner.lock().await;

        if let Some(previous) = owner.take() {
            if previous != task.id {
                self.cancel_identifiers(&previous).await;
            }
        }
        self.cancel_identifiers(&task.id).await;
        if let Some(legacy) = task.notification_id.as_deref() {
            self.cancel_identifiers(legacy).await;
        }

        let now = Utc::now();
        let trigger = now + Duration::seconds(remaining_secs.max(0));
        let handle = completion_handle(task, Some(trigger), now);

        self.delivery
            .schedule(handle.clone())
            .await
            .map_err(CoreError::from)?;
        *owner = Some(task.id.clone());

        let identifier = handle.identifier.clone();
        let persisted = self
            .store
            .update(
                &task.id,
                Box::new(move |t| {
                    t.notification_id = Some(identifier);
                    t.next_reminder_time = Some(trigger);
                    t.timer_state.notification_status = NotificationStatus::Scheduled;
                }),
            )
            .await;

        if let Err(err) = persisted {
            if err.is_not_found() {
                self.cancel_identifiers(&task.id).await;
                *owner = None;
            }
            return Err(err);
        }

        log_info!(
            "Scheduled {} for {} (reschedule #{})",
            handle.identifier,
            trigger.to_rfc3339(),
            task.reschedule_count
        );
        Ok(handle)
    }

    /// Best-effort cancel of both the literal identifier and the derived
    /// `task_<id>` form. Never fails.
    pub async fn cancel(&self, handle_or_task_id: &str) {
        let task_id = task_id_from_identifier(handle_or_task_id);
        {
            let mut owner = self.owner.lock().await;
            if owner.as_deref() == Some(task_id) {
                *owner = None;
            }
        }
        self.cancel_identifiers(handle_or_task_id).await;
    }

    /// Fire the completion notification now. Used only when the timer expires
    /// while the application is in the background.
    pub async fn deliver_immediate(&self, task: &Task) -> CoreResult<DeliveryOutcome> {
        let mut owner = self.owner.lock().await;
        if owner.as_deref() == Some(task.id.as_str()) {
            *owner = None;
        }

        let identifier = notification_identifier(&task.id);
        let now = Utc::now();
        let presented = match self.delivery.delivered().await {
            Ok(delivered) => delivered
                .iter()
                .any(|d| d.identifier == identifier && now.signed_duration_since(d.delivered_at) < self.window),
            Err(err) => {
                log_warn!("Could not read delivered notifications: {err:#}");
                false
            }
        };

        if presented {
            log_info!("{identifier} already presented; skipping immediate delivery");
            return Ok(DeliveryOutcome::AlreadyPresented);
        }

        self.cancel_identifiers(&task.id).await;
        self.delivery
            .schedule(completion_handle(task, None, now))
            .await
            .map_err(CoreError::from)?;

        log_info!("Delivered {identifier} immediately");
        Ok(DeliveryOutcome::Delivered)
    }

    pub fn publish_completion(&self, event: CompletionEvent) {
        self.events.emit(EngineEvent::Completion(event));
    }

    /// Number of scheduled handles the delivery service holds for `task_id`.
    pub async fn live_handles(&self, task_id: &str) -> CoreResult<usize> {
        let identifier = notification_identifier(task_id);
        let pending = self.delivery.pending().await.map_err(CoreError::from)?;
        Ok(pending.iter().filter(|h| h.identifier == identifier).count())
    }

    async fn cancel_identifiers(&self, handle_or_task_id: &str) {
        let derived = notification_identifier(task_id_from_identifier(handle_or_task_id));
        let mut candidates = vec![handle_or_task_id.to_string()];
        if derived != handle_or_task_id {
            candidates.push(derived);
        }

        for identifier in candidates {
            if let Err(err) = self.delivery.cancel(&identifier).await {
                log_warn!("Failed to cancel notification {identifier}: {err:#}");
            }
        }
    }
}
