use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    db::Database,
    error::{CoreError, CoreResult},
    events::{CompletionEvent, CompletionSource, EngineEvent, EventBus},
    ledger::Ledger,
    lifecycle::AppPhase,
    models::{NotificationStatus, Task, DEFAULT_DURATION_MINUTES},
    notifications::{DeliveryOutcome, NotificationDispatcher},
    store::TaskStore,
};

use super::state::{calculate_remaining, TimerSlot, TimerStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Durations closer than this are treated as the same timer.
const DURATION_EPSILON_MINUTES: f64 = 1e-6;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub slot: TimerSlot,
    pub remaining_secs: i64,
}

impl TimerSnapshot {
    fn of(slot: &TimerSlot, now: DateTime<Utc>) -> Self {
        Self {
            slot: slot.clone(),
            remaining_secs: slot.remaining_secs(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpiryOutcome {
    NotExpired { remaining_secs: i64 },
    /// No timer on the record (never started, reset, or already completed).
    Inactive,
    Completed(CompletionEvent),
    /// Another path already handled this expiry inside the suppression window.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct TimerOptions {
    pub tick_interval: Duration,
    pub heartbeat_every_ticks: u32,
    pub completion_xp: u32,
    pub default_duration_minutes: f64,
}

impl Default for TimerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            heartbeat_every_ticks: 10,
            completion_xp: 10,
            default_duration_minutes: DEFAULT_DURATION_MINUTES,
        }
    }
}

/// Owns the single in-process countdown (`currentlyTimedTaskId`) and the
/// ticker that drives it. The task record stays authoritative; the slot is
/// re-derived from it on every state change.
#[derive(Clone)]
pub struct TimerController {
    slot: Arc<Mutex<TimerSlot>>,
    store: Arc<dyn TaskStore>,
    ledger: Arc<Ledger>,
    dispatcher: Arc<NotificationDispatcher>,
    db: Database,
    events: EventBus,
    phase: watch::Receiver<AppPhase>,
    /// Held for the whole of start, pause, resume, reset and attach so slot
    /// transitions never interleave.
    ops: Arc<Mutex<()>>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
    heartbeat_every_ticks: u32,
    completion_xp: u32,
    default_duration_minutes: f64,
}

impl TimerController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<Ledger>,
        dispatcher: Arc<NotificationDispatcher>,
        db: Database,
        events: EventBus,
        phase: watch::Receiver<AppPhase>,
        options: TimerOptions,
    ) -> Self {
        let debug_mode = std::env::var("TASKPULSE_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            slot: Arc::new(Mutex::new(TimerSlot::new())),
            store,
            ledger,
            dispatcher,
            db,
            events,
            phase,
            ops: Arc::new(Mutex::new(())),
            ticker: Arc::new(Mutex::new(None)),
            tick_interval: options.tick_interval,
            heartbeat_every_ticks: if debug_mode {
                1
            } else {
                options.heartbeat_every_ticks.max(1)
            },
            completion_xp: options.completion_xp,
            default_duration_minutes: options.default_duration_minutes,
        }
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        let guard = self.slot.lock().await;
        TimerSnapshot::of(&guard, Utc::now())
    }

    pub async fn current_task_id(&self) -> Option<String> {
        self.slot.lock().await.task_id.clone()
    }

    /// Start (or restart) the countdown for `task_id`.
    ///
    /// Starting a timer that is already running with the same duration is a
    /// no-op. `duration_minutes` defaults to the task's interval.
    pub async fn start(
        &self,
        task_id: &str,
        duration_minutes: Option<f64>,
    ) -> CoreResult<TimerSnapshot> {
        let _op = self.ops.lock().await;
        let task = self.load(task_id).await?;
        if task.completed {
            return Err(CoreError::invalid(format!(
                "task {task_id} is completed and cannot hold a timer"
            )));
        }

        let duration = match duration_minutes {
            Some(minutes) if minutes.is_finite() && minutes > 0.0 => minutes,
            Some(minutes) => {
                let err = CoreError::InvalidTimerData {
                    message: format!("duration {minutes} requested for {task_id}"),
                };
                log_warn!("{err}; using the task interval");
                task.interval_minutes(self.default_duration_minutes)
            }
            None => task.interval_minutes(self.default_duration_minutes),
        };

        let displaced = {
            let slot = self.slot.lock().await;
            let same_duration =
                (task.timer_state.duration - duration).abs() < DURATION_EPSILON_MINUTES;
            if slot.holds(task_id)
                && slot.status == TimerStatus::Active
                && task.timer_state.is_running()
                && same_duration
            {
                log_info!("Timer for {task_id} already running with {duration} min; ignoring start");
                return Ok(TimerSnapshot::of(&slot, Utc::now()));
            }
            match (&slot.task_id, slot.status) {
                (Some(holder), TimerStatus::Active | TimerStatus::Paused) if holder != task_id => {
                    Some(holder.clone())
                }
                _ => None,
            }
        };

        self.cancel_ticker().await;
        if let Some(previous) = displaced {
            self.abandon(&previous).await;
        }

        let now = Utc::now();
        let started = self
            .write(task_id, move |t| t.timer_state.begin(now, duration))
            .await?;

        self.slot.lock().await.attach(&started);
        self.schedule_reminder(&started, calculate_remaining(&started, now))
            .await?;
        self.spawn_ticker(task_id.to_string()).await;

        log_info!("Started {duration} min timer for {task_id}");
        self.emit_state_changed().await;
        Ok(self.snapshot().await)
    }

    /// Freeze the running countdown. No-op unless a timer is active.
    pub async fn pause(&self) -> CoreResult<TimerSnapshot> {
        let _op = self.ops.lock().await;
        let task_id = {
            let slot = self.slot.lock().await;
            match (&slot.task_id, slot.status) {
                (Some(id), TimerStatus::Active) => id.clone(),
                _ => return Ok(TimerSnapshot::of(&slot, Utc::now())),
            }
        };

        self.cancel_ticker().await;

        let now = Utc::now();
        self.write(&task_id, move |t| {
            if t.timer_state.is_running() {
                t.timer_state.pause(now);
            }
        })
        .await?;

        self.slot.lock().await.pause(now);
        self.dispatcher.cancel(&task_id).await;

        log_info!("Paused timer for {task_id}");
        self.emit_state_changed().await;
        Ok(self.snapshot().await)
    }

    /// Continue a paused countdown. The time left at pause is folded into a
    /// fresh duration measured from now.
    pub async fn resume(&self) -> CoreResult<TimerSnapshot> {
        let _op = self.ops.lock().await;
        let task_id = {
            let slot = self.slot.lock().await;
            match (&slot.task_id, slot.status) {
                (Some(id), TimerStatus::Paused) => id.clone(),
                _ => return Ok(TimerSnapshot::of(&slot, Utc::now())),
            }
        };

        let task = self.load(&task_id).await?;
        let now = Utc::now();
        let remaining = calculate_remaining(&task, now);

        if remaining <= 0 {
            let resumed = self
                .write(&task_id, |t| {
                    t.timer_state.is_paused = false;
                    t.timer_state.paused_at = None;
                })
                .await?;
            self.slot.lock().await.attach(&resumed);
            self.check_expiry(&task_id, CompletionSource::TimerExpiry)
                .await?;
            return Ok(self.snapshot().await);
        }

        let folded = remaining as f64 / 60.0;
        let resumed = self
            .write(&task_id, move |t| {
                let timer = &mut t.timer_state;
                timer.start_time = Some(now);
                timer.is_paused = false;
                timer.paused_at = None;
                timer.duration = folded;
                timer.notification_status = NotificationStatus::Pending;
            })
            .await?;

        self.slot.lock().await.attach(&resumed);
        self.schedule_reminder(&resumed, remaining).await?;
        self.spawn_ticker(task_id.clone()).await;

        log_info!("Resumed timer for {task_id} with {remaining}s left");
        self.emit_state_changed().await;
        Ok(self.snapshot().await)
    }

    /// Clear every timer field on the record and drop its reminder.
    pub async fn reset(&self, task_id: &str) -> CoreResult<TimerSnapshot> {
        let _op = self.ops.lock().await;
        self.release(task_id).await;
        self.write(task_id, |t| {
            t.timer_state.clear();
            t.notification_id = None;
            t.next_reminder_time = None;
        })
        .await?;

        log_info!("Reset timer for {task_id}");
        self.emit_state_changed().await;
        Ok(self.snapshot().await)
    }

    /// Drop the in-process state held for `task_id` without touching its
    /// record: stop the ticker, empty the slot and cancel the reminder.
    pub async fn release(&self, task_id: &str) {
        let held = {
            let mut slot = self.slot.lock().await;
            let held = slot.holds(task_id);
            if held {
                slot.clear();
            }
            held
        };
        if held {
            self.cancel_ticker().await;
        }
        self.dispatcher.cancel(task_id).await;
    }

    /// Re-attach the slot to a record whose timer is already active, without
    /// touching its start time. Used after a cold start.
    pub async fn attach(&self, task: &Task) -> CoreResult<()> {
        if !task.timer_state.is_active || task.completed {
            return Ok(());
        }
        let _op = self.ops.lock().await;

        self.slot.lock().await.attach(task);

        if task.timer_state.is_running() {
            let remaining = calculate_remaining(task, Utc::now());
            if remaining > 0 && self.dispatcher.owner().await.as_deref() != Some(task.id.as_str())
            {
                self.schedule_reminder(task, remaining).await?;
            }
            self.spawn_ticker(task.id.clone()).await;
        }

        log_info!("Re-attached timer for {}", task.id);
        self.emit_state_changed().await;
        Ok(())
    }

    /// The expiry path shared by the ticker and reconciliation.
    ///
    /// The record is moved to its completed state idempotently, then the
    /// ledger decides which caller performs the side effects (credit,
    /// notification, prompt). Everyone else gets [`ExpiryOutcome::Duplicate`].
    pub async fn check_expiry(
        &self,
        task_id: &str,
        source: CompletionSource,
    ) -> CoreResult<ExpiryOutcome> {
        let task = self.load(task_id).await?;
        let timer = &task.timer_state;
        if !timer.is_active || task.completed {
            return Ok(ExpiryOutcome::Inactive);
        }

        let now = Utc::now();
        let remaining = calculate_remaining(&task, now);
        if timer.is_paused || remaining > 0 {
            return Ok(ExpiryOutcome::NotExpired {
                remaining_secs: remaining,
            });
        }

        let foreground = *self.phase.borrow() == AppPhase::Foreground;
        let completed = self
            .write(task_id, move |t| {
                if t.timer_state.is_active {
                    t.timer_state.mark_completed(now, foreground);
                }
            })
            .await?;

        self.finish_slot(task_id).await;

        if let Err(err) = self.ledger.claim(task_id, source.as_str()).await {
            log_info!("Suppressing expiry via {}: {err}", source.as_str());
            return Ok(ExpiryOutcome::Duplicate);
        }

        if let Err(err) = self
            .db
            .insert_completion_credit(task_id, now, self.completion_xp)
            .await
        {
            log_error!("Failed to record completion credit for {task_id}: {err:#}");
        }

        let foreground = completed.timer_state.completed_in_foreground;
        if foreground {
            self.dispatcher.cancel(task_id).await;
            if let Err(err) = self
                .store
                .update(task_id, Box::new(|t| t.timer_state.modal_shown = true))
                .await
            {
                log_warn!("Could not mark prompt shown for {task_id}: {err}");
            }
        } else {
            match self.dispatcher.deliver_immediate(&completed).await {
                Ok(DeliveryOutcome::Delivered) => {}
                Ok(DeliveryOutcome::AlreadyPresented) => {
                    log_info!("Reminder for {task_id} was already on screen");
                }
                Err(err) => {
                    log_warn!("Immediate delivery for {task_id} failed: {err}");
                }
            }
        }

        let event = CompletionEvent {
            task_id: task_id.to_string(),
            foreground,
            source,
        };
        self.dispatcher.publish_completion(event.clone());

        log_info!(
            "Timer for {task_id} completed ({})",
            if foreground { "foreground" } else { "background" }
        );
        self.emit_state_changed().await;
        Ok(ExpiryOutcome::Completed(event))
    }

    /// The slot is moving to another task: the old record gives up its timer
    /// so the slot stays re-derivable from the records.
    async fn abandon(&self, task_id: &str) {
        self.dispatcher.cancel(task_id).await;
        let cleared = self
            .store
            .update(
                task_id,
                Box::new(|t| {
                    if t.timer_state.is_active {
                        t.timer_state.clear();
                        t.notification_id = None;
                        t.next_reminder_time = None;
                    }
                }),
            )
            .await;

        match cleared {
            Ok(_) => log_info!("Cleared abandoned timer for {task_id}"),
            Err(err) if err.is_not_found() => {}
            Err(err) => log_warn!("Could not clear abandoned timer for {task_id}: {err}"),
        }
    }

    async fn finish_slot(&self, task_id: &str) {
        let held = {
            let mut slot = self.slot.lock().await;
            let held = slot.holds(task_id);
            if held {
                slot.complete();
            }
            held
        };
        if held {
            self.cancel_ticker().await;
        }
    }

    async fn schedule_reminder(&self, task: &Task, remaining_secs: i64) -> CoreResult<()> {
        match self.dispatcher.schedule_completion(task, remaining_secs).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Err(self.task_gone(&task.id).await),
            Err(err) => {
                // The ticker still drives expiry; the next start or resume reschedules.
                log_warn!("Could not schedule reminder for {}: {err}", task.id);
                Ok(())
            }
        }
    }

    async fn load(&self, task_id: &str) -> CoreResult<Task> {
        match self.store.get(task_id).await {
            Err(err) if err.is_not_found() => Err(self.task_gone(task_id).await),
            other => other,
        }
    }

    async fn write<F>(&self, task_id: &str, mutation: F) -> CoreResult<Task>
    where
        F: FnOnce(&mut Task) + Send + 'static,
    {
        match self.store.update(task_id, Box::new(mutation)).await {
            Err(err) if err.is_not_found() => Err(self.task_gone(task_id).await),
            other => other,
        }
    }

    /// Terminal: the record vanished underneath us. Forget it and tell
    /// observers instead of retrying.
    async fn task_gone(&self, task_id: &str) -> CoreError {
        log_warn!("Task {task_id} no longer exists; dropping its timer");
        self.release(task_id).await;
        self.events.emit(EngineEvent::TaskGone {
            task_id: task_id.to_string(),
        });
        self.emit_state_changed().await;
        CoreError::not_found(task_id)
    }

    async fn spawn_ticker(&self, task_id: String) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let controller = self.clone();
        let tick_interval = self.tick_interval;
        let heartbeat_every = self.heartbeat_every_ticks;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u32 = 0;
            loop {
                interval.tick().await;

                let snapshot = {
                    let guard = controller.slot.lock().await;
                    if guard.status != TimerStatus::Active || !guard.holds(&task_id) {
                        break;
                    }
                    TimerSnapshot::of(&guard, Utc::now())
                };

                if snapshot.remaining_secs <= 0 {
                    // Spawned: finishing the slot aborts this ticker, which must
                    // not cut the expiry path short.
                    let expiry = {
                        let controller = controller.clone();
                        let task_id = task_id.clone();
                        tokio::spawn(async move {
                            controller
                                .check_expiry(&task_id, CompletionSource::TimerExpiry)
                                .await
                        })
                    };

                    match expiry.await {
                        Ok(Ok(ExpiryOutcome::NotExpired { .. })) => continue,
                        Ok(Ok(_)) => break,
                        Ok(Err(err)) if err.is_not_found() => break,
                        Ok(Err(err)) => {
                            log_warn!("Expiry check for {task_id} failed, retrying next tick: {err}");
                            continue;
                        }
                        Err(err) => {
                            log_error!("Expiry check for {task_id} did not finish: {err}");
                            break;
                        }
                    }
                }

                ticks = ticks.wrapping_add(1);
                if ticks % heartbeat_every == 0 {
                    log_debug!("{task_id}: {}s left", snapshot.remaining_secs);
                    controller.events.emit(EngineEvent::TimerHeartbeat(snapshot));
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    async fn emit_state_changed(&self) {
        let snapshot = self.snapshot().await;
        self.events.emit(EngineEvent::TimerStateChanged(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Priority,
        notifications::LocalDelivery,
        store::{SqliteTaskStore, TaskMutation},
    };
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the next `failing_updates` writes with a transient error.
    struct FlakyStore {
        inner: SqliteTaskStore,
        failing_updates: AtomicU32,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn insert(&self, task: &Task) -> CoreResult<()> {
            self.inner.insert(task).await
        }

        async fn get(&self, task_id: &str) -> CoreResult<Task> {
            self.inner.get(task_id).await
        }

        async fn update(&self, task_id: &str, mutation: TaskMutation) -> CoreResult<Task> {
            let fail = self
                .failing_updates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(CoreError::transient("store unavailable"));
            }
            self.inner.update(task_id, mutation).await
        }

        async fn delete(&self, task_id: &str) -> CoreResult<bool> {
            self.inner.delete(task_id).await
        }

        async fn list_open(&self, user_id: &str) -> CoreResult<Vec<Task>> {
            self.inner.list_open(user_id).await
        }
    }

    struct Fixture {
        controller: TimerController,
        store: Arc<SqliteTaskStore>,
        delivery: Arc<LocalDelivery>,
        db: Database,
        phase: watch::Sender<AppPhase>,
    }

    fn controller_over(
        store: Arc<dyn TaskStore>,
        db: &Database,
        delivery: Arc<LocalDelivery>,
        phase: watch::Receiver<AppPhase>,
    ) -> TimerController {
        let events = EventBus::new();
        let window = ChronoDuration::seconds(10);
        let ledger = Arc::new(Ledger::new(db.clone(), delivery.clone(), window));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            delivery,
            store.clone(),
            events.clone(),
            window,
        ));
        TimerController::new(
            store,
            ledger,
            dispatcher,
            db.clone(),
            events,
            phase,
            TimerOptions {
                tick_interval: Duration::from_millis(20),
                ..TimerOptions::default()
            },
        )
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let delivery = Arc::new(LocalDelivery::new());
        let store = Arc::new(SqliteTaskStore::new(db.clone(), DEFAULT_DURATION_MINUTES));
        let (phase, phase_rx) = watch::channel(AppPhase::Foreground);
        let controller = controller_over(store.clone(), &db, delivery.clone(), phase_rx);
        Fixture {
            controller,
            store,
            delivery,
            db,
            phase,
        }
    }

    async fn insert(store: &SqliteTaskStore, task: Task) -> Task {
        store.insert(&task).await.unwrap();
        task
    }

    async fn insert_expired(store: &SqliteTaskStore, id: &str) -> Task {
        let mut task = Task::new("u1", "stretch", Priority::Urgent, 5).with_id(id);
        task.timer_state
            .begin(Utc::now() - ChronoDuration::seconds(310), 5.0);
        insert(store, task).await
    }

    #[tokio::test]
    async fn start_persists_and_schedules() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("t1")).await;

        let snapshot = f.controller.start("t1", None).await.unwrap();

        assert_eq!(snapshot.slot.status, TimerStatus::Active);
        assert_eq!(snapshot.slot.task_id.as_deref(), Some("t1"));
        assert!(snapshot.remaining_secs > 295);
        let stored = f.store.get("t1").await.unwrap();
        assert!(stored.timer_state.is_active);
        assert!(stored.timer_state.start_time.is_some());
        assert_eq!(stored.timer_state.notification_status, NotificationStatus::Scheduled);
        assert_eq!(f.delivery.pending_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn restarting_with_same_duration_is_a_no_op() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("t1")).await;

        f.controller.start("t1", None).await.unwrap();
        let first = f.store.get("t1").await.unwrap().timer_state.start_time;
        f.controller.start("t1", Some(5.0)).await.unwrap();
        let second = f.store.get("t1").await.unwrap().timer_state.start_time;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn restarting_with_new_duration_restarts() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("t1")).await;

        f.controller.start("t1", None).await.unwrap();
        let snapshot = f.controller.start("t1", Some(10.0)).await.unwrap();

        assert!(snapshot.remaining_secs > 595);
        assert_eq!(f.store.get("t1").await.unwrap().timer_state.duration, 10.0);
        assert_eq!(f.delivery.pending_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_preserve_remaining_time() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("t1")).await;
        f.controller.start("t1", None).await.unwrap();

        let paused = f.controller.pause().await.unwrap();
        assert_eq!(paused.slot.status, TimerStatus::Paused);
        assert!(f.delivery.pending_snapshot().is_empty(), "paused timer kept its reminder");
        assert!(f.store.get("t1").await.unwrap().timer_state.is_paused);

        let resumed = f.controller.resume().await.unwrap();
        assert_eq!(resumed.slot.status, TimerStatus::Active);
        assert!(resumed.remaining_secs >= 298 && resumed.remaining_secs <= 300);
        let stored = f.store.get("t1").await.unwrap();
        assert!(!stored.timer_state.is_paused);
        assert!(stored.timer_state.duration <= 5.0);
        assert_eq!(f.delivery.pending_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn pause_without_timer_is_a_no_op() {
        let f = fixture();
        let snapshot = f.controller.pause().await.unwrap();
        assert_eq!(snapshot.slot.status, TimerStatus::Idle);
    }

    #[tokio::test]
    async fn expiry_fires_once() {
        let f = fixture();
        insert_expired(&f.store, "t1").await;

        let first = f
            .controller
            .check_expiry("t1", CompletionSource::TimerExpiry)
            .await
            .unwrap();
        let second = f
            .controller
            .check_expiry("t1", CompletionSource::TimerExpiry)
            .await
            .unwrap();

        assert!(matches!(first, ExpiryOutcome::Completed(ref e) if e.foreground));
        assert_eq!(second, ExpiryOutcome::Inactive);
        let stored = f.store.get("t1").await.unwrap();
        assert!(stored.timer_state.is_completed);
        assert!(stored.timer_state.modal_shown);
        assert_eq!(f.db.count_completion_credits("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn background_expiry_delivers_immediately() {
        let f = fixture();
        f.phase.send_replace(AppPhase::Background);
        insert_expired(&f.store, "t1").await;

        let outcome = f
            .controller
            .check_expiry("t1", CompletionSource::TimerExpiry)
            .await
            .unwrap();

        assert!(matches!(outcome, ExpiryOutcome::Completed(ref e) if !e.foreground));
        let stored = f.store.get("t1").await.unwrap();
        assert!(stored.timer_state.background_completed);
        assert!(!stored.timer_state.modal_shown);
        let delivered = f.delivery.delivered_snapshot();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].identifier, "task_t1");
    }

    #[tokio::test]
    async fn ticker_drives_expiry() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "blink", Priority::High, 1).with_id("t1")).await;
        f.controller.start("t1", Some(0.02)).await.unwrap();

        let mut completed = false;
        for _ in 0..250 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if f.store.get("t1").await.unwrap().timer_state.is_completed {
                completed = true;
                break;
            }
        }

        assert!(completed, "ticker never expired the timer");
        assert_eq!(f.controller.snapshot().await.slot.status, TimerStatus::Completed);
    }

    #[tokio::test]
    async fn deleted_task_reports_gone() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("t1")).await;
        f.controller.start("t1", None).await.unwrap();
        f.store.delete("t1").await.unwrap();

        let err = f.controller.pause().await.unwrap_err();

        assert!(err.is_not_found());
        assert!(f.controller.current_task_id().await.is_none());
        assert!(f.delivery.pending_snapshot().is_empty());
    }

    #[tokio::test]
    async fn reset_clears_timer_fields() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("t1")).await;
        f.controller.start("t1", None).await.unwrap();

        f.controller.reset("t1").await.unwrap();

        let stored = f.store.get("t1").await.unwrap();
        assert!(!stored.timer_state.is_active);
        assert!(stored.notification_id.is_none());
        assert!(f.delivery.pending_snapshot().is_empty());
        assert_eq!(f.controller.snapshot().await.slot.status, TimerStatus::Idle);
    }

    #[tokio::test]
    async fn switching_tasks_clears_the_displaced_timer() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::Urgent, 5).with_id("a")).await;
        insert(&f.store, Task::new("u1", "write", Priority::Lowest, 5).with_id("b")).await;
        insert(&f.store, Task::new("u1", "walk", Priority::Medium, 5).with_id("c")).await;

        f.controller.start("a", None).await.unwrap();
        f.controller.start("b", None).await.unwrap();

        let a = f.store.get("a").await.unwrap();
        assert!(!a.timer_state.is_active, "displaced record kept its timer");
        assert!(a.timer_state.start_time.is_none());
        assert!(a.notification_id.is_none());
        assert!(f.store.get("b").await.unwrap().timer_state.is_active);

        f.controller.pause().await.unwrap();
        f.controller.start("c", None).await.unwrap();

        assert!(!f.store.get("b").await.unwrap().timer_state.is_active);
        let pending = f.delivery.pending_snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id(), "c");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_leave_one_consistent_holder() {
        let f = fixture();
        insert(&f.store, Task::new("u1", "read", Priority::High, 5).with_id("a")).await;
        insert(&f.store, Task::new("u1", "write", Priority::High, 5).with_id("b")).await;

        let (a, b) = tokio::join!(f.controller.start("a", None), f.controller.start("b", None));
        a.unwrap();
        b.unwrap();

        let holder = f.controller.current_task_id().await.unwrap();
        let other = if holder == "a" { "b" } else { "a" };
        assert!(f.store.get(&holder).await.unwrap().timer_state.is_active);
        assert!(!f.store.get(other).await.unwrap().timer_state.is_active);
        let pending = f.delivery.pending_snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id(), holder);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let ticking = f
            .controller
            .ticker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        assert!(ticking, "ticker stopped for the slot holder");
    }

    #[tokio::test]
    async fn failed_expiry_write_is_retried_on_the_next_tick() {
        let db = Database::in_memory().unwrap();
        let delivery = Arc::new(LocalDelivery::new());
        let store = Arc::new(FlakyStore {
            inner: SqliteTaskStore::new(db.clone(), DEFAULT_DURATION_MINUTES),
            failing_updates: AtomicU32::new(0),
        });
        let (_phase, phase_rx) = watch::channel(AppPhase::Foreground);
        let controller = controller_over(store.clone(), &db, delivery, phase_rx);
        store
            .insert(&Task::new("u1", "blink", Priority::High, 1).with_id("t1"))
            .await
            .unwrap();

        controller.start("t1", Some(0.02)).await.unwrap();
        store.failing_updates.store(3, Ordering::SeqCst);

        let mut completed = false;
        for _ in 0..250 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get("t1").await.unwrap().timer_state.is_completed {
                completed = true;
                break;
            }
        }

        assert!(completed, "expiry was not retried after a failed write");
        assert_eq!(store.failing_updates.load(Ordering::SeqCst), 0);
        assert_eq!(db.count_completion_credits("t1").await.unwrap(), 1);
        assert_eq!(controller.snapshot().await.slot.status, TimerStatus::Completed);
    }
}
