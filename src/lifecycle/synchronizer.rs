use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;

use crate::{
    events::{CompletionEvent, CompletionSource},
    ledger::Ledger,
    models::Task,
    notifications::NotificationDispatcher,
    priority::{self, PriorityConfig},
    store::TaskStore,
    timer::{calculate_remaining, ExpiryOutcome, TimerController},
};

const ENABLE_LOGS: bool = true;

/// Added to the suppression window before a deferred pass runs.
const DEFERRED_PASS_MARGIN: Duration = Duration::from_millis(100);

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppPhase {
    Foreground,
    Background,
}

/// One query of the reconciliation pass, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileStep {
    CompletedUnacknowledged,
    /// `completedAt` without `isCompleted`, written by older clients.
    LegacyCompletedAt,
    BackgroundCompleted,
}

impl ReconcileStep {
    const ALL: [ReconcileStep; 3] = [
        ReconcileStep::CompletedUnacknowledged,
        ReconcileStep::LegacyCompletedAt,
        ReconcileStep::BackgroundCompleted,
    ];

    fn matches(&self, task: &Task) -> bool {
        let timer = &task.timer_state;
        if task.completed || timer.is_active || timer.modal_shown {
            return false;
        }
        match self {
            ReconcileStep::CompletedUnacknowledged => timer.is_completed,
            ReconcileStep::LegacyCompletedAt => timer.completed_at.is_some() && !timer.is_completed,
            ReconcileStep::BackgroundCompleted => timer.background_completed,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ReconcileStep::CompletedUnacknowledged => "completed",
            ReconcileStep::LegacyCompletedAt => "legacy-completed-at",
            ReconcileStep::BackgroundCompleted => "background-completed",
        }
    }
}

enum Surfacing {
    Shown(CompletionEvent),
    /// Another path handled this task inside the suppression window.
    Suppressed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub user_id: String,
    pub legacy_completed_at: bool,
    pub priority: PriorityConfig,
}

/// Re-derives truth from the task records whenever the host application
/// comes back, and decides whether a completion prompt must be shown now.
pub struct LifecycleSynchronizer {
    store: Arc<dyn TaskStore>,
    ledger: Arc<Ledger>,
    dispatcher: Arc<NotificationDispatcher>,
    timer: TimerController,
    phase: watch::Sender<AppPhase>,
    /// Parent of every running pass; replaced each time the app backgrounds.
    in_flight: Mutex<CancellationToken>,
    deferred_pending: AtomicBool,
    options: ReconcileOptions,
}

impl LifecycleSynchronizer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<Ledger>,
        dispatcher: Arc<NotificationDispatcher>,
        timer: TimerController,
        phase: watch::Sender<AppPhase>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            store,
            ledger,
            dispatcher,
            timer,
            phase,
            in_flight: Mutex::new(CancellationToken::new()),
            deferred_pending: AtomicBool::new(false),
            options,
        }
    }

    pub fn phase(&self) -> AppPhase {
        *self.phase.borrow()
    }

    pub async fn on_foreground(self: &Arc<Self>) -> Option<CompletionEvent> {
        self.phase.send_replace(AppPhase::Foreground);
        self.reconcile(false, CompletionSource::Reconcile).await
    }

    /// Abandons any in-flight pass; the next transition starts over from the records.
    pub fn on_background(&self) {
        self.phase.send_replace(AppPhase::Background);
        let abandoned = std::mem::replace(&mut *self.lock_in_flight(), CancellationToken::new());
        abandoned.cancel();
    }

    pub async fn on_cold_start(self: &Arc<Self>) -> Option<CompletionEvent> {
        self.phase.send_replace(AppPhase::Foreground);
        self.reconcile(true, CompletionSource::Reconcile).await
    }

    pub async fn on_notification_response(self: &Arc<Self>, task_id: &str) -> Option<CompletionEvent> {
        log_info!("Notification response for {task_id}");
        self.phase.send_replace(AppPhase::Foreground);
        self.reconcile(false, CompletionSource::NotificationResponse)
            .await
    }

    async fn reconcile(
        self: &Arc<Self>,
        cold_start: bool,
        source: CompletionSource,
    ) -> Option<CompletionEvent> {
        let token = self.lock_in_flight().child_token();

        let (surfaced, suppressed) = tokio::select! {
            outcome = self.run_pass(cold_start, source) => outcome,
            _ = token.cancelled() => {
                log_info!("Reconciliation pass abandoned");
                return None;
            }
        };

        if surfaced.is_none() && suppressed {
            self.defer_pass(source);
        }
        surfaced
    }

    /// A completion that is still unacknowledged but was suppressed gets
    /// another pass once the window has passed, unless the app backgrounds.
    fn defer_pass(self: &Arc<Self>, source: CompletionSource) {
        if self.deferred_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(window) = self.ledger.window().to_std() else {
            self.deferred_pending.store(false, Ordering::SeqCst);
            return;
        };

        let token = self.lock_in_flight().child_token();
        let this = Arc::clone(self);
        log_info!("Completion suppressed; re-checking in {}ms", window.as_millis());

        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(window + DEFERRED_PASS_MARGIN) => {
                    this.deferred_pending.store(false, Ordering::SeqCst);
                    if this.phase() == AppPhase::Foreground {
                        this.reconcile(false, source).await;
                    }
                }
                _ = token.cancelled() => {
                    this.deferred_pending.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    /// Returns the surfaced completion and whether any candidate was
    /// suppressed by the ledger.
    async fn run_pass(
        &self,
        cold_start: bool,
        source: CompletionSource,
    ) -> (Option<CompletionEvent>, bool) {
        if let Some(event) = self.sweep_expired(cold_start).await {
            return (Some(event), false);
        }

        let mut suppressed = false;

        for step in ReconcileStep::ALL {
            if step == ReconcileStep::LegacyCompletedAt && !self.options.legacy_completed_at {
                continue;
            }

            let tasks = match self.store.list_open(&self.options.user_id).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    log_warn!("Reconcile query '{}' failed: {err}", step.label());
                    continue;
                }
            };

            for task in tasks.iter().filter(|task| step.matches(task)) {
                match self.surface(task, step, source).await {
                    Surfacing::Shown(event) => return (Some(event), false),
                    Surfacing::Suppressed => suppressed = true,
                    Surfacing::Failed => {}
                }
            }
        }

        (None, suppressed)
    }

    /// Runs the expiry path for timers that ran out while nobody was ticking,
    /// and on cold start re-attaches the best still-running timer.
    async fn sweep_expired(&self, cold_start: bool) -> Option<CompletionEvent> {
        let tasks = match self.store.list_open(&self.options.user_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                log_warn!("Expired-timer sweep failed: {err}");
                return None;
            }
        };

        let now = Utc::now();
        let mut surfaced = None;
        for task in tasks
            .iter()
            .filter(|task| task.timer_state.is_running() && calculate_remaining(task, now) <= 0)
        {
            // Detached so an abandoned pass cannot cut the expiry path in half.
            let timer = self.timer.clone();
            let task_id = task.id.clone();
            let expiry = tokio::spawn(async move {
                timer.check_expiry(&task_id, CompletionSource::Reconcile).await
            });

            match expiry.await {
                Ok(Ok(ExpiryOutcome::Completed(event))) if event.foreground && surfaced.is_none() => {
                    surfaced = Some(event);
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log_warn!("Expiry check for {} during reconcile failed: {err}", task.id),
                Err(err) => log_warn!("Expiry check for {} did not finish: {err}", task.id),
            }
        }

        if cold_start && self.timer.current_task_id().await.is_none() {
            let running: Vec<Task> = tasks
                .into_iter()
                .filter(|task| {
                    task.timer_state.is_active
                        && (task.timer_state.is_paused || calculate_remaining(task, now) > 0)
                })
                .collect();
            if let Some(best) = priority::select(&running, now, None, &self.options.priority) {
                if let Err(err) = self.timer.attach(best).await {
                    log_warn!("Could not restore timer for {}: {err}", best.id);
                }
            }
        }

        surfaced
    }

    async fn surface(
        &self,
        task: &Task,
        step: ReconcileStep,
        source: CompletionSource,
    ) -> Surfacing {
        if !self.ledger.try_claim(&task.id, source.as_str()).await {
            log_info!("{} ({}) already handled recently; not surfacing", task.id, step.label());
            return Surfacing::Suppressed;
        }

        if let Err(err) = self
            .store
            .update(&task.id, Box::new(|t| t.timer_state.modal_shown = true))
            .await
        {
            log_warn!("Could not mark {} as shown: {err}", task.id);
            return Surfacing::Failed;
        }
        self.dispatcher.cancel(&task.id).await;

        let event = CompletionEvent {
            task_id: task.id.clone(),
            foreground: true,
            source,
        };
        self.dispatcher.publish_completion(event.clone());
        log_info!("Surfacing completion of {} ({})", task.id, step.label());
        Surfacing::Shown(event)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, CancellationToken> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    fn finished(id: &str) -> Task {
        let mut task = Task::new("u1", id, Priority::Medium, 5).with_id(id);
        task.timer_state.mark_completed(Utc::now(), false);
        task
    }

    #[test]
    fn steps_respect_the_modal_guard() {
        let mut task = finished("t1");
        assert!(ReconcileStep::CompletedUnacknowledged.matches(&task));
        assert!(ReconcileStep::BackgroundCompleted.matches(&task));
        assert!(!ReconcileStep::LegacyCompletedAt.matches(&task));

        task.timer_state.modal_shown = true;
        assert!(ReconcileStep::ALL.iter().all(|step| !step.matches(&task)));
    }

    #[test]
    fn legacy_step_needs_completed_at_only() {
        let mut task = Task::new("u1", "old", Priority::Medium, 5).with_id("old");
        task.timer_state.completed_at = Some(Utc::now());

        assert!(ReconcileStep::LegacyCompletedAt.matches(&task));
        assert!(!ReconcileStep::CompletedUnacknowledged.matches(&task));
    }

    #[test]
    fn completed_tasks_are_never_candidates() {
        let mut task = finished("t1");
        task.completed = true;
        assert!(ReconcileStep::ALL.iter().all(|step| !step.matches(&task)));
    }
}
