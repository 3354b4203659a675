use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const TABLE_DEBOUNCE: Duration = Duration::from_millis(100);
const LIVE_QUERY_DEBOUNCE: Duration = Duration::from_millis(50);

/// The kind of change that produced a notification, mirroring the
/// statement classification used by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A notification delivered to subscribers: either a per-table change, or
/// the synthetic `"*"` sync event delivered to global subscribers only.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Table { table: String, kind: ChangeKind, trigger_sync: bool },
    Sync,
}

struct Subscribers {
    global: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    per_table: HashMap<String, Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    pending_timers: HashMap<String, JoinHandle<()>>,
}

impl Default for Subscribers {
    fn default() -> Self {
        Self { global: Vec::new(), per_table: HashMap::new(), pending_timers: HashMap::new() }
    }
}

/// In-process fan-out of per-table change events with a 100ms trailing-
/// edge debounce keyed by table name. `notify_sync()` bypasses debounce
/// entirely and reaches global subscribers only.
pub struct ChangeNotifier {
    state: Arc<Mutex<Subscribers>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(Subscribers::default())) }
    }

    pub async fn subscribe_all(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.global.push(tx);
        rx
    }

    pub async fn subscribe_table(&self, table: &str) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.per_table.entry(table.to_string()).or_default().push(tx);
        rx
    }

    /// Schedules a debounced notification for `table`. A notification
    /// already pending for this table is replaced: only the last call
    /// within the 100ms window is delivered, exactly once.
    pub async fn notify(&self, table: &str, kind: ChangeKind) {
        self.notify_with_flag(table, kind, true).await
    }

    /// Same as `notify`, but lets the caller mark the event as not having
    /// originated from a local write the scheduler should upload — used
    /// by the worker after applying remote changes.
    pub async fn notify_with_flag(&self, table: &str, kind: ChangeKind, trigger_sync: bool) {
        let table = table.to_string();
        let state = self.state.clone();
        let mut guard = self.state.lock().await;
        if let Some(handle) = guard.pending_timers.remove(&table) {
            handle.abort();
        }
        let table_for_task = table.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(TABLE_DEBOUNCE).await;
            let mut guard = state.lock().await;
            guard.pending_timers.remove(&table_for_task);
            if let Some(subs) = guard.per_table.get(&table_for_task) {
                for sub in subs {
                    let _ = sub.send(ChangeEvent::Table {
                        table: table_for_task.clone(),
                        kind,
                        trigger_sync,
                    });
                }
            }
            for sub in &guard.global {
                let _ = sub.send(ChangeEvent::Table {
                    table: table_for_task.clone(),
                    kind,
                    trigger_sync,
                });
            }
        });
        guard.pending_timers.insert(table, handle);
    }

    /// Emits the synthetic `"*"` sync event synchronously to global
    /// listeners only, bypassing debounce.
    pub async fn notify_sync(&self) {
        let guard = self.state.lock().await;
        for sub in &guard.global {
            let _ = sub.send(ChangeEvent::Sync);
        }
    }

    /// Cancels every pending debounce timer. Idempotent.
    pub async fn dispose(&self) {
        let mut guard = self.state.lock().await;
        for (_, handle) in guard.pending_timers.drain() {
            handle.abort();
        }
    }
}

fn hash_key(sql: &str, args: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    for a in args {
        a.hash(&mut hasher);
    }
    hasher.finish()
}

/// A live query: seeds once, then re-runs on any notification for a table
/// the query touches, publishing the latest result set. Identical
/// `(sql, args)` watches share a single 50ms debounce coalescing window.
/// Query errors are delivered on the same stream and never terminate it.
pub struct LiveQueryWatcher {
    notifier: Arc<ChangeNotifier>,
    shared_debounces: Arc<Mutex<HashMap<u64, Arc<Mutex<Option<JoinHandle<()>>>>>>>,
}

impl LiveQueryWatcher {
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self { notifier, shared_debounces: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Subscribes to `tables` and invokes `run` once immediately (the
    /// seed), then again after each coalesced notification. `run`'s result
    /// (including errors) is sent on the returned channel.
    pub async fn watch<F, Fut, T>(
        &self,
        sql: &str,
        args: &[String],
        tables: &[String],
        run: F,
    ) -> mpsc::UnboundedReceiver<Result<T, crate::error::SyncError>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, crate::error::SyncError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let run = Arc::new(run);

        // Seed.
        let seeded = run().await;
        let _ = tx.send(seeded);

        let key = hash_key(sql, args);
        let debounce_slot = {
            let mut guard = self.shared_debounces.lock().await;
            guard.entry(key).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
        };

        for table in tables {
            let mut sub = self.notifier.subscribe_table(table).await;
            let tx = tx.clone();
            let run = run.clone();
            let debounce_slot = debounce_slot.clone();
            tokio::spawn(async move {
                while sub.recv().await.is_some() {
                    let tx = tx.clone();
                    let run = run.clone();
                    let mut slot = debounce_slot.lock().await;
                    if let Some(handle) = slot.take() {
                        handle.abort();
                    }
                    *slot = Some(tokio::spawn(async move {
                        tokio::time::sleep(LIVE_QUERY_DEBOUNCE).await;
                        let result = run().await;
                        let _ = tx.send(result);
                    }));
                }
            });
        }

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn table_notifications_are_debounced_to_one() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe_table("users").await;

        for _ in 0..5 {
            notifier.notify("users", ChangeKind::Insert).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let event = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.unwrap();
        assert!(event.is_some());
        let none_yet = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(none_yet.is_err(), "expected exactly one debounced notification");
    }

    #[tokio::test]
    async fn notify_sync_reaches_global_listeners_only() {
        let notifier = ChangeNotifier::new();
        let mut global = notifier.subscribe_all().await;
        let mut table = notifier.subscribe_table("users").await;

        notifier.notify_sync().await;

        let event = tokio::time::timeout(Duration::from_millis(50), global.recv()).await.unwrap();
        assert!(matches!(event, Some(ChangeEvent::Sync)));
        let table_event = tokio::time::timeout(Duration::from_millis(150), table.recv()).await;
        assert!(table_event.is_err());
    }

    #[tokio::test]
    async fn dispose_cancels_pending_timers() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe_table("users").await;
        notifier.notify("users", ChangeKind::Insert).await;
        notifier.dispose().await;
        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(event.is_err());
    }
}
