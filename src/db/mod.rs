mod connection;
mod migrations;
mod repositories;

pub use connection::Database;

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::Database;
    use crate::models::{LedgerEntry, Priority, Task};

    #[tokio::test]
    async fn task_documents_round_trip() {
        let db = Database::in_memory().unwrap();
        let task = Task::new("u1", "water plants", Priority::High, 5).with_id("t1");
        db.insert_task(&task).await.unwrap();

        let doc = db.get_task_document("t1").await.unwrap().expect("document");
        assert_eq!(doc["text"], "water plants");
        assert!(db.get_task_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn modify_missing_document_returns_none() {
        let db = Database::in_memory().unwrap();
        let result = db
            .modify_task_document("ghost", |_| Err(anyhow::anyhow!("should not be called")))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn completed_tasks_drop_out_of_open_listing() {
        let db = Database::in_memory().unwrap();
        let open = Task::new("u1", "open", Priority::Medium, 5).with_id("a");
        let mut done = Task::new("u1", "done", Priority::Medium, 5).with_id("b");
        done.complete(Utc::now());
        let other_user = Task::new("u2", "theirs", Priority::Medium, 5).with_id("c");
        for task in [&open, &done, &other_user] {
            db.insert_task(task).await.unwrap();
        }

        let docs = db.list_open_task_documents("u1").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["id"], "a");
    }

    #[tokio::test]
    async fn ledger_entries_overwrite_instead_of_appending() {
        let db = Database::in_memory().unwrap();
        let first = Utc::now() - Duration::minutes(5);
        let second = Utc::now();

        db.upsert_ledger_entry(&LedgerEntry::sent("t1", first, Some("timer-expiry")))
            .await
            .unwrap();
        db.upsert_ledger_entry(&LedgerEntry::sent("t1", second, Some("reconcile")))
            .await
            .unwrap();

        let entry = db.get_ledger_entry("t1").await.unwrap().expect("entry");
        assert_eq!(entry.source.as_deref(), Some("reconcile"));
        assert_eq!(entry.timestamp.timestamp(), second.timestamp());
        assert_eq!(db.clear_ledger().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn credits_accumulate_per_task() {
        let db = Database::in_memory().unwrap();
        db.insert_completion_credit("t1", Utc::now(), 10).await.unwrap();
        db.insert_completion_credit("t2", Utc::now(), 15).await.unwrap();

        assert_eq!(db.count_completion_credits("t1").await.unwrap(), 1);
        assert_eq!(db.total_xp().await.unwrap(), 25);
    }
}
