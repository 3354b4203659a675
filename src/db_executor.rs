use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use rusqlite::Connection;
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Owns the single `rusqlite::Connection` used by the engine. Every other
/// component reaches the database by posting a boxed closure here and
/// awaiting the reply over a oneshot channel; the connection itself never
/// crosses a thread boundary.
///
/// This is the "sync-executor thread" shape called for by the
/// specification's concurrency design notes: `rusqlite::Connection` is
/// `Send` but not `Sync`, so a dedicated owner thread is simpler and
/// safer than wrapping it in a mutex shared across the tokio runtime.
pub struct DbExecutor {
    tx: std_mpsc::Sender<Job>,
    _handle: JoinHandle<()>,
}

impl DbExecutor {
    pub fn open(path: &str) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let conn = Connection::open(path)?;
        let handle = std::thread::Builder::new()
            .name("sync-executor".into())
            .spawn(move || Self::run_loop(conn, rx))
            .expect("failed to spawn sync-executor thread");
        Ok(Self { tx, _handle: handle })
    }

    pub fn open_in_memory() -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let conn = Connection::open_in_memory()?;
        let handle = std::thread::Builder::new()
            .name("sync-executor".into())
            .spawn(move || Self::run_loop(conn, rx))
            .expect("failed to spawn sync-executor thread");
        Ok(Self { tx, _handle: handle })
    }

    fn run_loop(mut conn: Connection, rx: std_mpsc::Receiver<Job>) {
        while let Ok(job) = rx.recv() {
            job(&mut conn);
        }
        tracing::debug!("sync-executor thread exiting, channel closed");
    }

    /// Run `f` against the connection on the executor thread and await its
    /// result on the calling (async) task.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let result = f(conn);
            let _ = reply_tx.send(result);
        });
        self.tx.send(job).map_err(|_| SyncError::ExecutorGone)?;
        reply_rx.await.map_err(|_| SyncError::ExecutorGone)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_closures_on_the_executor_thread() {
        let exec = DbExecutor::open_in_memory().unwrap();
        let n: i64 = exec
            .run(|conn| {
                conn.query_row("SELECT 1 + 1", [], |row| row.get(0))
                    .map_err(SyncError::from)
            })
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn propagates_database_errors() {
        let exec = DbExecutor::open_in_memory().unwrap();
        let result: Result<i64> = exec
            .run(|conn| {
                conn.query_row("SELECT * FROM nonexistent_table", [], |row| row.get(0))
                    .map_err(SyncError::from)
            })
            .await;
        assert!(matches!(result, Err(SyncError::Database(_))));
    }
}
