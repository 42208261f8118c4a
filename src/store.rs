//! Boundary to the external document store holding task records.
//!
//! Every document that crosses this boundary is normalized with
//! [`Task::standardize`], so the rest of the core only ever sees well-formed
//! tasks.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;

use crate::{
    db::Database,
    error::{CoreError, CoreResult},
    models::Task,
};

/// Mutation applied to a task inside an atomic read-modify-write.
pub type TaskMutation = Box<dyn FnOnce(&mut Task) + Send + 'static>;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> CoreResult<()>;

    /// `CoreError::NotFound` when the record does not exist.
    async fn get(&self, task_id: &str) -> CoreResult<Task>;

    /// Atomically applies `mutation` to the stored record and returns the
    /// result. `CoreError::NotFound` when the record is gone.
    async fn update(&self, task_id: &str, mutation: TaskMutation) -> CoreResult<Task>;

    /// Returns whether a record was removed.
    async fn delete(&self, task_id: &str) -> CoreResult<bool>;

    /// Every non-completed task owned by `user_id`.
    async fn list_open(&self, user_id: &str) -> CoreResult<Vec<Task>>;
}

/// [`TaskStore`] backed by the local SQLite document table.
#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Database,
    default_duration_minutes: f64,
}

impl SqliteTaskStore {
    pub fn new(db: Database, default_duration_minutes: f64) -> Self {
        Self {
            db,
            default_duration_minutes,
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> CoreResult<()> {
        let mut record = task.clone();
        record.enforce_invariants(Utc::now());
        Ok(self.db.insert_task(&record).await?)
    }

    async fn get(&self, task_id: &str) -> CoreResult<Task> {
        let document = self
            .db
            .get_task_document(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found(task_id))?;
        Task::standardize(&document, self.default_duration_minutes)
    }

    async fn update(&self, task_id: &str, mutation: TaskMutation) -> CoreResult<Task> {
        let default_duration = self.default_duration_minutes;
        let updated = self
            .db
            .modify_task_document(task_id, move |document| {
                let mut task = Task::standardize(&document, default_duration)?;
                mutation(&mut task);
                let now = Utc::now();
                task.enforce_invariants(now);
                task.updated_at = now;
                Ok(task)
            })
            .await?;

        updated.ok_or_else(|| CoreError::not_found(task_id))
    }

    async fn delete(&self, task_id: &str) -> CoreResult<bool> {
        Ok(self.db.delete_task(task_id).await?)
    }

    async fn list_open(&self, user_id: &str) -> CoreResult<Vec<Task>> {
        let documents = self.db.list_open_task_documents(user_id).await?;
        let tasks = documents
            .iter()
            .filter_map(
                |doc| match Task::standardize(doc, self.default_duration_minutes) {
                    Ok(task) => Some(task),
                    Err(err) => {
                        warn!("Ignoring unreadable task document: {err}");
                        None
                    }
                },
            )
            .collect();
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, DEFAULT_DURATION_MINUTES};

    fn store() -> SqliteTaskStore {
        SqliteTaskStore::new(Database::in_memory().unwrap(), DEFAULT_DURATION_MINUTES)
    }

    #[tokio::test]
    async fn update_applies_mutation_and_invariants() {
        let store = store();
        let task = Task::new("u1", "stretch", Priority::Medium, 5).with_id("t1");
        store.insert(&task).await.unwrap();

        let updated = store
            .update(
                "t1",
                Box::new(|t| {
                    t.timer_state.is_active = true;
                    t.completed = true;
                }),
            )
            .await
            .unwrap();

        assert!(updated.completed);
        assert!(!updated.timer_state.is_active, "completed task kept a timer");
        assert_eq!(store.get("t1").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn missing_records_report_not_found() {
        let store = store();
        assert!(store.get("nope").await.unwrap_err().is_not_found());
        assert!(store
            .update("nope", Box::new(|_| {}))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!store.delete("nope").await.unwrap());
    }
}
