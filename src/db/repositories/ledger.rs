use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::{
    db::connection::Database,
    models::{LedgerEntry, LedgerStatus},
};

fn status_from_str(value: &str) -> Result<LedgerStatus> {
    match value {
        "sent" => Ok(LedgerStatus::Sent),
        other => Err(anyhow!("unknown ledger status '{other}'")),
    }
}

impl Database {
    /// Overwrites any previous entry for the same task.
    pub async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let record = entry.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO ledger_entries (task_id, marked_at, status, source)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.task_id,
                    record.timestamp.to_rfc3339(),
                    record.status.as_str(),
                    record.source,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_ledger_entry(&self, task_id: &str) -> Result<Option<LedgerEntry>> {
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            let row: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT marked_at, status, source FROM ledger_entries WHERE task_id = ?1",
                    params![task_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            row.map(|(marked_at, status, source)| {
                Ok(LedgerEntry {
                    task_id: task_id.clone(),
                    timestamp: DateTime::parse_from_rfc3339(&marked_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .with_context(|| format!("bad marked_at for ledger entry {task_id}"))?,
                    status: status_from_str(&status)?,
                    source,
                })
            })
            .transpose()
        })
        .await
    }

    pub async fn clear_ledger(&self) -> Result<usize> {
        self.execute(|conn| Ok(conn.execute("DELETE FROM ledger_entries", [])?))
            .await
    }
}
