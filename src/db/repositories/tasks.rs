use anyhow::{Context, Result};
use log::error;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::{db::connection::Database, models::Task};

fn parse_document(raw: &str, task_id: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("task {task_id} has a malformed document"))
}

impl Database {
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let record = task.clone();
        self.execute(move |conn| {
            let document = serde_json::to_string(&record)?;
            conn.execute(
                "INSERT INTO tasks (id, user_id, completed, document, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.user_id,
                    record.completed,
                    document,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert task {}", record.id))?;
            Ok(())
        })
        .await
    }

    pub async fn get_task_document(&self, task_id: &str) -> Result<Option<Value>> {
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT document FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| parse_document(&raw, &task_id)).transpose()
        })
        .await
    }

    /// Read-modify-write of one document inside a single transaction.
    ///
    /// `modify` receives the stored JSON and returns the task to write back.
    /// Returns `Ok(None)` when no row exists for `task_id`.
    pub async fn modify_task_document<F>(&self, task_id: &str, modify: F) -> Result<Option<Task>>
    where
        F: FnOnce(Value) -> Result<Task> + Send + 'static,
    {
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let raw: Option<String> = tx
                .query_row(
                    "SELECT document FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(raw) = raw else {
                return Ok(None);
            };

            let task = modify(parse_document(&raw, &task_id)?)?;
            let document = serde_json::to_string(&task)?;

            tx.execute(
                "UPDATE tasks
                 SET user_id = ?1,
                     completed = ?2,
                     document = ?3,
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    task.user_id,
                    task.completed,
                    document,
                    task.updated_at.to_rfc3339(),
                    task_id,
                ],
            )?;

            tx.commit()?;
            Ok(Some(task))
        })
        .await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            Ok(rows_affected > 0)
        })
        .await
    }

    /// Non-completed task documents for one user. Rows whose JSON cannot be
    /// parsed are logged and skipped.
    pub async fn list_open_task_documents(&self, user_id: &str) -> Result<Vec<Value>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, document FROM tasks
                 WHERE user_id = ?1 AND completed = 0
                 ORDER BY created_at ASC",
            )?;

            let mut rows = stmt.query(params![user_id])?;
            let mut documents = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let raw: String = row.get(1)?;
                match parse_document(&raw, &id) {
                    Ok(document) => documents.push(document),
                    Err(err) => error!("Skipping task row: {err:#}"),
                }
            }

            Ok(documents)
        })
        .await
    }
}
