//! Duplicate-suppression ledger.
//!
//! A task id is "recently processed" when any of three layers holds a mark
//! younger than the suppression window:
//!
//! 1. the in-memory map (same-process races),
//! 2. the durable mirror in SQLite (survives a restart),
//! 3. an immediate device notification already delivered for `task_<id>`.
//!
//! [`Ledger::try_claim`] is the check-and-mark used by every completion path;
//! its in-memory step runs under one lock, so for a given task id exactly one
//! concurrent caller wins.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};

use crate::{
    db::Database,
    error::{CoreError, CoreResult},
    models::{notification_identifier, LedgerEntry},
    notifications::DeliveryService,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const DEFAULT_SUPPRESSION_WINDOW_SECS: u64 = 10;

pub struct Ledger {
    memory: Mutex<HashMap<String, LedgerEntry>>,
    db: Database,
    delivery: Arc<dyn DeliveryService>,
    window: Duration,
}

impl Ledger {
    pub fn new(db: Database, delivery: Arc<dyn DeliveryService>, window: Duration) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            db,
            delivery,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn was_recently_processed(&self, task_id: &str) -> bool {
        let now = Utc::now();
        self.memory_hit(task_id, now)
            || self.durable_hit(task_id, now).await
            || self.delivered_hit(task_id, now).await
    }

    /// Writes every layer; last write wins. The in-memory mark always lands,
    /// a failed durable write is reported as transient.
    pub async fn mark_processed(&self, task_id: &str, source: &str) -> CoreResult<()> {
        let entry = LedgerEntry::sent(task_id, Utc::now(), Some(source));
        self.lock_memory().insert(task_id.to_string(), entry.clone());
        self.db
            .upsert_ledger_entry(&entry)
            .await
            .map_err(CoreError::from)
    }

    /// Atomically check and mark. Returns `true` only for the single caller
    /// allowed to perform side effects for this task within the window.
    pub async fn try_claim(&self, task_id: &str, source: &str) -> bool {
        let now = Utc::now();
        let entry = LedgerEntry::sent(task_id, now, Some(source));

        {
            let mut memory = self.lock_memory();
            if memory
                .get(task_id)
                .is_some_and(|existing| existing.is_fresh(now, self.window))
            {
                log_info!("{task_id} already claimed in-process; suppressing {source}");
                return false;
            }
            memory.insert(task_id.to_string(), entry.clone());
        }

        if self.durable_hit(task_id, now).await || self.delivered_hit(task_id, now).await {
            log_info!("{task_id} already processed before this process saw it; suppressing {source}");
            return false;
        }

        if let Err(err) = self.db.upsert_ledger_entry(&entry).await {
            log_warn!("Durable ledger write failed for {task_id}: {err:#}");
        }
        true
    }

    /// [`Ledger::try_claim`] as a result: `StaleDuplicate` when another path
    /// already owns this expiry.
    pub async fn claim(&self, task_id: &str, source: &str) -> CoreResult<()> {
        if self.try_claim(task_id, source).await {
            Ok(())
        } else {
            Err(CoreError::StaleDuplicate {
                task_id: task_id.to_string(),
            })
        }
    }

    /// Full-system reset: forget every mark in every layer we own.
    pub async fn clear_all(&self) -> CoreResult<()> {
        self.lock_memory().clear();
        self.db.clear_ledger().await?;
        Ok(())
    }

    fn memory_hit(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        self.lock_memory()
            .get(task_id)
            .is_some_and(|entry| entry.is_fresh(now, self.window))
    }

    async fn durable_hit(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        match self.db.get_ledger_entry(task_id).await {
            Ok(entry) => entry.is_some_and(|entry| entry.is_fresh(now, self.window)),
            Err(err) => {
                log_warn!("Durable ledger read failed for {task_id}: {err:#}");
                false
            }
        }
    }

    async fn delivered_hit(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        let identifier = notification_identifier(task_id);
        match self.delivery.delivered().await {
            Ok(delivered) => delivered.iter().any(|d| {
                d.immediate
                    && d.identifier == identifier
                    && now.signed_duration_since(d.delivered_at) < self.window
            }),
            Err(err) => {
                log_warn!("Delivered-notification check failed for {task_id}: {err:#}");
                false
            }
        }
    }

    fn lock_memory(&self) -> MutexGuard<'_, HashMap<String, LedgerEntry>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
