use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use crate::{ledger::DEFAULT_SUPPRESSION_WINDOW_SECS, models::DEFAULT_DURATION_MINUTES};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub user_id: String,
    pub suppression_window_secs: u64,
    pub tick_interval_ms: u64,
    pub heartbeat_every_ticks: u32,
    pub default_duration_minutes: f64,
    pub completion_xp: u32,
    /// Start the next best task after one is completed or deleted.
    pub auto_advance: bool,
    /// Also surface records that only carry `completedAt`.
    pub legacy_completed_at_reconcile: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            user_id: "local".into(),
            suppression_window_secs: DEFAULT_SUPPRESSION_WINDOW_SECS,
            tick_interval_ms: 1_000,
            heartbeat_every_ticks: 10,
            default_duration_minutes: DEFAULT_DURATION_MINUTES,
            completion_xp: 10,
            auto_advance: true,
            legacy_completed_at_reconcile: true,
        }
    }
}

impl EngineSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn suppression_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.suppression_window_secs).unwrap_or(i64::MAX))
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<EngineSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            EngineSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn engine(&self) -> EngineSettings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_engine(&self, settings: EngineSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        *guard = settings;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: EngineSettings = serde_json::from_str(&contents)
            .with_context(|| format!("Malformed settings in {}", self.path.display()))?;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
        Ok(())
    }

    fn persist(&self, data: &EngineSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.engine(), EngineSettings::default());
        assert_eq!(store.engine().suppression_window_secs, 10);
    }

    #[test]
    fn updates_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        let mut settings = store.engine();
        settings.user_id = "ada".into();
        settings.auto_advance = false;
        store.update_engine(settings.clone()).unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.engine(), settings);
        reopened.reload().unwrap();
        assert_eq!(reopened.engine().user_id, "ada");
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"user_id":"bob","completion_xp":25}"#).unwrap();

        let settings = SettingsStore::new(path).unwrap().engine();
        assert_eq!(settings.user_id, "bob");
        assert_eq!(settings.completion_xp, 25);
        assert_eq!(settings.tick_interval_ms, 1_000);
    }
}
