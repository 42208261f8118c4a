use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::connection::Database;

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{what} came back negative ({value})"))
}

impl Database {
    pub async fn insert_completion_credit(
        &self,
        task_id: &str,
        awarded_at: DateTime<Utc>,
        xp: u32,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO completion_credits (task_id, awarded_at, xp) VALUES (?1, ?2, ?3)",
                params![task_id, awarded_at.to_rfc3339(), i64::from(xp)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn count_completion_credits(&self, task_id: &str) -> Result<u64> {
        let task_id = task_id.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM completion_credits WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            non_negative(count, "credit count")
        })
        .await
    }

    pub async fn total_xp(&self) -> Result<u64> {
        self.execute(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(xp), 0) FROM completion_credits",
                [],
                |row| row.get(0),
            )?;
            non_negative(total, "xp total")
        })
        .await
    }
}
