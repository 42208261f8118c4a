use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

/// How long a statement waits on a lock held by another handle to the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory,
}

impl Target {
    fn open(&self) -> Result<Connection> {
        let conn = match self {
            Target::File(path) => Connection::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
            Target::Memory => {
                Connection::open_in_memory().context("failed to open in-memory database")?
            }
        };

        if matches!(self, Target::File(_)) {
            if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                warn!("WAL journal unavailable, keeping the default: {err}");
            }
        }
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set busy timeout")?;

        Ok(conn)
    }
}

/// Owns the worker thread. Dropping the job sender ends the worker's receive
/// loop, after which the thread is joined.
struct Worker {
    jobs: Option<mpsc::Sender<Job>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn start(target: Target) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("taskpulse-db".into())
            .spawn(move || {
                let opened = target.open().and_then(|mut conn| {
                    run_migrations(&mut conn).context("failed to run database migrations")?;
                    Ok(conn)
                });
                match opened {
                    Ok(conn) => {
                        if ready_tx.send(Ok(())).is_ok() {
                            serve(conn, jobs_rx);
                        }
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                    }
                }
            })
            .context("failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited during startup")??;

        Ok(Self {
            jobs: Some(jobs_tx),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| anyhow!("database worker already stopped"))?
            .send(job)
            .map_err(|_| anyhow!("database worker is gone"))
    }
}

fn serve(mut conn: Connection, jobs: mpsc::Receiver<Job>) {
    for job in jobs {
        job(&mut conn);
    }
    info!("Database worker stopped");
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.jobs.take());
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Database worker panicked");
            }
        }
    }
}

/// Handle to the SQLite worker thread. Clones share one connection, so
/// statements run one at a time in submission order.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Option<Arc<PathBuf>>,
}

impl Database {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let worker = Worker::start(Target::File(path.clone()))?;
        info!("Task database ready at {}", path.display());

        Ok(Self {
            worker: Arc::new(worker),
            path: Some(Arc::new(path)),
        })
    }

    /// Private in-memory database; gone when the last handle drops.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            worker: Arc::new(Worker::start(Target::Memory)?),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Runs `work` on the worker thread and hands back its result.
    pub async fn execute<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.worker.submit(Box::new(move |conn| {
            // A caller that gave up waiting is not an error for the worker.
            let _ = reply_tx.send(work(conn));
        }))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database worker dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pragma(db: &Database, name: &'static str) -> i64 {
        db.execute(move |conn| Ok(conn.pragma_query_value(None, name, |row| row.get(0))?))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connections_enforce_foreign_keys_and_wait_on_locks() {
        let db = Database::in_memory().unwrap();

        assert_eq!(pragma(&db, "foreign_keys").await, 1);
        assert_eq!(pragma(&db, "busy_timeout").await, BUSY_TIMEOUT.as_millis() as i64);
        assert!(db.path().is_none());
    }

    #[tokio::test]
    async fn file_database_keeps_its_schema_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.sqlite3");

        let first = Database::new(path.clone()).unwrap();
        let version = pragma(&first, "user_version").await;
        assert!(version > 0);
        drop(first);

        let reopened = Database::new(path.clone()).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        assert_eq!(pragma(&reopened, "user_version").await, version);
    }

    #[tokio::test]
    async fn clones_share_one_connection() {
        let db = Database::in_memory().unwrap();
        let other = db.clone();

        db.execute(|conn| Ok(conn.execute_batch("CREATE TABLE scratch (n INTEGER)")?))
            .await
            .unwrap();
        other
            .execute(|conn| Ok(conn.execute("INSERT INTO scratch (n) VALUES (1)", [])?))
            .await
            .unwrap();

        let count: i64 = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM scratch", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
