pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod notifications;
pub mod priority;
pub mod settings;
mod shell;
pub mod store;
pub mod timer;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use db::Database;
use error::{CoreError, CoreResult};
use events::{CompletionEvent, CompletionSource, EngineEvent, EventBus};
use ledger::Ledger;
use lifecycle::{AppPhase, LifecycleSynchronizer, ReconcileOptions};
use models::Task;
use notifications::{DeliveryService, NotificationDispatcher};
use priority::PriorityConfig;
use settings::EngineSettings;
use store::{SqliteTaskStore, TaskStore};
use timer::{
    calculate_remaining, ExpiryOutcome, TimerController, TimerOptions, TimerSnapshot, TimerStatus,
};

const ENABLE_LOGS: bool = true;

/// Everything the surrounding application talks to. One per process.
pub struct Engine {
    db: Database,
    store: Arc<dyn TaskStore>,
    ledger: Arc<Ledger>,
    dispatcher: Arc<NotificationDispatcher>,
    timer: TimerController,
    lifecycle: Arc<LifecycleSynchronizer>,
    events: EventBus,
    settings: EngineSettings,
    priority: PriorityConfig,
}

impl Engine {
    /// Engine over the local SQLite task table.
    pub fn new(db: Database, delivery: Arc<dyn DeliveryService>, settings: EngineSettings) -> Self {
        let store = Arc::new(SqliteTaskStore::new(
            db.clone(),
            settings.default_duration_minutes,
        ));
        Self::with_store(db, store, delivery, settings)
    }

    pub fn with_store(
        db: Database,
        store: Arc<dyn TaskStore>,
        delivery: Arc<dyn DeliveryService>,
        settings: EngineSettings,
    ) -> Self {
        let events = EventBus::new();
        let window = settings.suppression_window();
        let priority = PriorityConfig::default();

        let ledger = Arc::new(Ledger::new(db.clone(), delivery.clone(), window));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            delivery,
            store.clone(),
            events.clone(),
            window,
        ));

        let (phase_tx, phase_rx) = watch::channel(AppPhase::Foreground);
        let timer = TimerController::new(
            store.clone(),
            ledger.clone(),
            dispatcher.clone(),
            db.clone(),
            events.clone(),
            phase_rx,
            TimerOptions {
                tick_interval: settings.tick_interval(),
                heartbeat_every_ticks: settings.heartbeat_every_ticks,
                completion_xp: settings.completion_xp,
                default_duration_minutes: settings.default_duration_minutes,
            },
        );
        let lifecycle = Arc::new(LifecycleSynchronizer::new(
            store.clone(),
            ledger.clone(),
            dispatcher.clone(),
            timer.clone(),
            phase_tx,
            ReconcileOptions {
                user_id: settings.user_id.clone(),
                legacy_completed_at: settings.legacy_completed_at_reconcile,
                priority: priority.clone(),
            },
        ));

        Self {
            db,
            store,
            ledger,
            dispatcher,
            timer,
            lifecycle,
            events,
            settings,
            priority,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> AppPhase {
        self.lifecycle.phase()
    }

    pub async fn create_task(&self, task: Task) -> CoreResult<Task> {
        self.store.insert(&task).await?;
        self.store.get(&task.id).await
    }

    /// Insert a task from a loose external document.
    pub async fn import_task(&self, raw: &Value) -> CoreResult<Task> {
        let task = Task::standardize(raw, self.settings.default_duration_minutes)?;
        self.create_task(task).await
    }

    pub async fn get_task(&self, task_id: &str) -> CoreResult<Task> {
        self.store.get(task_id).await
    }

    pub async fn list_open(&self) -> CoreResult<Vec<Task>> {
        self.store.list_open(&self.settings.user_id).await
    }

    pub async fn timer_snapshot(&self) -> TimerSnapshot {
        self.timer.snapshot().await
    }

    pub async fn start_timer_for_task(
        &self,
        task_id: &str,
        duration_minutes: Option<f64>,
    ) -> CoreResult<TimerSnapshot> {
        self.timer.start(task_id, duration_minutes).await
    }

    pub async fn pause_timer(&self) -> CoreResult<TimerSnapshot> {
        self.timer.pause().await
    }

    pub async fn resume_timer(&self) -> CoreResult<TimerSnapshot> {
        self.timer.resume().await
    }

    /// Mark the task done. Returns the timer that auto-advance started, if any.
    pub async fn complete_task(&self, task_id: &str) -> CoreResult<Option<TimerSnapshot>> {
        self.timer.release(task_id).await;

        let now = Utc::now();
        self.store
            .update(task_id, Box::new(move |t| t.complete(now)))
            .await
            .map_err(|err| self.observe_gone(task_id, err))?;

        crate::log_info!("Completed task {task_id}");
        Ok(self.advance().await)
    }

    /// Put the task back on the clock: bump the reschedule count and start a
    /// fresh countdown whose reminder says so.
    pub async fn reschedule_task(&self, task_id: &str) -> CoreResult<TimerSnapshot> {
        self.timer.release(task_id).await;

        self.store
            .update(
                task_id,
                Box::new(|t| {
                    t.reschedule_count = t.reschedule_count.saturating_add(1);
                    t.completed = false;
                    t.timer_state.clear();
                    t.notification_id = None;
                    t.next_reminder_time = None;
                }),
            )
            .await
            .map_err(|err| self.observe_gone(task_id, err))?;

        crate::log_info!("Rescheduled task {task_id}");
        self.timer.start(task_id, None).await
    }

    /// Remove the task and everything the engine holds for it. Returns
    /// whether a record was removed.
    pub async fn delete_task(&self, task_id: &str) -> CoreResult<bool> {
        self.timer.release(task_id).await;
        let removed = self.store.delete(task_id).await?;
        if removed {
            crate::log_info!("Deleted task {task_id}");
            self.advance().await;
        }
        Ok(removed)
    }

    /// Run the expiry path for `task_id` now, as a background task runner
    /// or a push handler would.
    pub async fn check_expiry(&self, task_id: &str) -> CoreResult<ExpiryOutcome> {
        self.timer
            .check_expiry(task_id, CompletionSource::TimerExpiry)
            .await
    }

    pub async fn get_remaining_seconds(&self, task_id: &str) -> CoreResult<i64> {
        let task = self.store.get(task_id).await?;
        Ok(calculate_remaining(&task, Utc::now()))
    }

    pub async fn on_foreground(&self) -> Option<CompletionEvent> {
        self.lifecycle.on_foreground().await
    }

    pub fn on_background(&self) {
        self.lifecycle.on_background();
    }

    pub async fn on_cold_start(&self) -> Option<CompletionEvent> {
        self.lifecycle.on_cold_start().await
    }

    pub async fn on_notification_response(&self, task_id: &str) -> Option<CompletionEvent> {
        self.lifecycle.on_notification_response(task_id).await
    }

    /// The task that should own the timer right now.
    pub async fn select_next(&self) -> CoreResult<Option<Task>> {
        let tasks = self.list_open().await?;
        let active = self.timer.current_task_id().await;
        Ok(
            priority::select(&tasks, Utc::now(), active.as_deref(), &self.priority)
                .cloned(),
        )
    }

    pub async fn completion_credits(&self, task_id: &str) -> CoreResult<u64> {
        Ok(self.db.count_completion_credits(task_id).await?)
    }

    pub async fn total_xp(&self) -> CoreResult<u64> {
        Ok(self.db.total_xp().await?)
    }

    pub async fn live_handles(&self, task_id: &str) -> CoreResult<usize> {
        self.dispatcher.live_handles(task_id).await
    }

    /// Full-system reset of the duplicate-suppression state.
    pub async fn reset_all(&self) -> CoreResult<()> {
        self.ledger.clear_all().await
    }

    /// Start the best candidate when the slot is free. Tasks whose timer
    /// already completed wait for the user instead.
    async fn advance(&self) -> Option<TimerSnapshot> {
        if !self.settings.auto_advance {
            return None;
        }
        let status = self.timer.snapshot().await.slot.status;
        if !matches!(status, TimerStatus::Idle | TimerStatus::Completed) {
            return None;
        }

        let candidates: Vec<Task> = match self.list_open().await {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|task| !task.timer_state.is_completed)
                .collect(),
            Err(err) => {
                crate::log_warn!("Auto-advance skipped: {err}");
                return None;
            }
        };
        let next = priority::select(&candidates, Utc::now(), None, &self.priority)?;

        let started = if next.timer_state.is_active {
            self.timer.attach(next).await.map(|_| ())
        } else {
            self.timer.start(&next.id, None).await.map(|_| ())
        };
        match started {
            Ok(()) => {
                crate::log_info!("Auto-advanced to {}", next.id);
                Some(self.timer.snapshot().await)
            }
            Err(err) => {
                crate::log_warn!("Auto-advance to {} failed: {err}", next.id);
                None
            }
        }
    }

    fn observe_gone(&self, task_id: &str, err: CoreError) -> CoreError {
        if err.is_not_found() {
            self.events.emit(EngineEvent::TaskGone {
                task_id: task_id.to_string(),
            });
        }
        err
    }
}

/// Headless entry point: `taskpulse [data_dir]`.
pub fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("taskpulse starting up...");

    let data_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start the tokio runtime")?;
    runtime.block_on(shell::run(data_dir))
}
