use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DeliveredNotification, NotificationHandle};

const MAX_DELIVERED_HISTORY: usize = 64;

/// The OS-level notification primitive. Scheduling a handle whose identifier
/// is already pending replaces the pending one.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn schedule(&self, handle: NotificationHandle) -> Result<()>;

    /// Cancelling an unknown identifier is not an error.
    async fn cancel(&self, identifier: &str) -> Result<()>;

    async fn pending(&self) -> Result<Vec<NotificationHandle>>;

    /// Recently presented notifications, oldest first.
    async fn delivered(&self) -> Result<Vec<DeliveredNotification>>;
}

#[derive(Default)]
struct LocalDeliveryState {
    pending: HashMap<String, NotificationHandle>,
    delivered: Vec<DeliveredNotification>,
}

impl LocalDeliveryState {
    fn record_delivery(&mut self, handle: &NotificationHandle, at: DateTime<Utc>) {
        self.delivered.push(DeliveredNotification {
            identifier: handle.identifier.clone(),
            task_id: handle.task_id().to_string(),
            delivered_at: at,
            immediate: handle.is_immediate(),
        });
        if self.delivered.len() > MAX_DELIVERED_HISTORY {
            self.delivered.remove(0);
        }
    }
}

/// In-process delivery service. Pending handles fire when [`LocalDelivery::fire_due`]
/// is pumped; immediate handles are delivered on schedule.
#[derive(Default)]
pub struct LocalDelivery {
    state: Mutex<LocalDeliveryState>,
    offline: AtomicBool,
}

impl LocalDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a dead delivery backend: every call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Deliver every pending handle whose trigger is at or before `now`.
    pub fn fire_due(&self, now: DateTime<Utc>) -> Vec<DeliveredNotification> {
        let mut state = self.lock();
        let due: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, handle)| handle.trigger_at.map_or(true, |at| at <= now))
            .map(|(identifier, _)| identifier.clone())
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for identifier in due {
            if let Some(handle) = state.pending.remove(&identifier) {
                state.record_delivery(&handle, now);
                if let Some(delivered) = state.delivered.last() {
                    fired.push(delivered.clone());
                }
            }
        }
        fired
    }

    pub fn pending_snapshot(&self) -> Vec<NotificationHandle> {
        self.lock().pending.values().cloned().collect()
    }

    pub fn delivered_snapshot(&self) -> Vec<DeliveredNotification> {
        self.lock().delivered.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LocalDeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("notification delivery service unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryService for LocalDelivery {
    async fn schedule(&self, handle: NotificationHandle) -> Result<()> {
        self.ensure_online()?;
        let mut state = self.lock();
        if handle.is_immediate() {
            state.pending.remove(&handle.identifier);
            state.record_delivery(&handle, Utc::now());
        } else {
            state.pending.insert(handle.identifier.clone(), handle);
        }
        Ok(())
    }

    async fn cancel(&self, identifier: &str) -> Result<()> {
        self.ensure_online()?;
        self.lock().pending.remove(identifier);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<NotificationHandle>> {
        self.ensure_online()?;
        Ok(self.pending_snapshot())
    }

    async fn delivered(&self) -> Result<Vec<DeliveredNotification>> {
        self.ensure_online()?;
        Ok(self.delivered_snapshot())
    }
}
