use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::aggregator::ChangeAggregator;
use crate::change_log::{ChangeLogStore, Operation};
use crate::config::SyncConfig;
use crate::db_executor::DbExecutor;
use crate::error::Result;
use crate::facade::DatabaseFacade;
use crate::merge::MergeEngine;
use crate::network::NetworkClient;
use crate::notifier::{ChangeEvent, ChangeKind, ChangeNotifier, LiveQueryWatcher};
use crate::queue::SyncQueue;
use crate::schema::SchemaManager;
use crate::scheduler::SyncScheduler;
use crate::worker::SyncWorker;

fn operation_of(kind: ChangeKind) -> Operation {
    match kind {
        ChangeKind::Insert => Operation::Insert,
        ChangeKind::Update => Operation::Update,
        ChangeKind::Delete => Operation::Delete,
    }
}

/// Wires every collaborator together behind one explicit context object.
/// Nothing here is a singleton: a process hosting more than one database
/// gets one `SyncEngine` per database, each with its own executor thread,
/// queue, scheduler, and notifier.
pub struct SyncEngine {
    db: Arc<DbExecutor>,
    facade: Arc<DatabaseFacade>,
    notifier: Arc<ChangeNotifier>,
    change_log: Arc<ChangeLogStore>,
    schema: Arc<SchemaManager>,
    queue: Arc<SyncQueue>,
    scheduler: Arc<SyncScheduler>,
    worker: Arc<SyncWorker>,
    network: Arc<NetworkClient>,
    live_query: Arc<LiveQueryWatcher>,
    config: SyncConfig,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Opens (or creates) the database at `db_path`, provisions the sync
    /// schema, and wires the engine's collaborators. Does not start
    /// background sync — call `start()` once authenticated.
    pub async fn open(
        db_path: &str,
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
        plugin_version: impl Into<String>,
        config: SyncConfig,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(crate::error::SyncError::Initialization)?;

        let db = Arc::new(DbExecutor::open(db_path)?);
        let change_log = Arc::new(ChangeLogStore::new(db.clone()));
        let schema = Arc::new(SchemaManager::new(db.clone(), change_log.clone(), plugin_version));
        schema.initialize().await?;

        let notifier = Arc::new(ChangeNotifier::new());
        let facade = Arc::new(DatabaseFacade::new(db.clone(), notifier.clone()));
        let aggregator = Arc::new(ChangeAggregator::new(change_log.clone()));
        let queue = Arc::new(SyncQueue::new());
        let network = Arc::new(NetworkClient::new(base_url, ws_url));
        let merge_engine = Arc::new(MergeEngine::new(config.conflict_strategy.clone(), config.custom_resolver.clone()));
        let live_query = Arc::new(LiveQueryWatcher::new(notifier.clone()));

        let worker = Arc::new(SyncWorker::new(
            db.clone(),
            change_log.clone(),
            schema.clone(),
            aggregator.clone(),
            queue.clone(),
            network.clone(),
            merge_engine.clone(),
            notifier.clone(),
            config.clone(),
        ));

        let scheduler_worker = worker.clone();
        let scheduler = Arc::new(SyncScheduler::new(
            queue.clone(),
            config.debounce_interval,
            Arc::new(move || -> crate::scheduler::SyncFuture {
                let worker = scheduler_worker.clone();
                Box::pin(async move {
                    if let Err(e) = worker.process_queue().await {
                        tracing::warn!(error = %e, "scheduled sync cycle failed");
                    }
                })
            }),
        ));

        Ok(Arc::new(Self {
            db,
            facade,
            notifier,
            change_log,
            schema,
            queue,
            scheduler,
            worker,
            network,
            live_query,
            config,
            background_tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Registers `table` for change tracking: adds `global_id`, installs
    /// the capture triggers, and (per config) back-fills existing rows as
    /// synthetic inserts.
    pub async fn track_table(&self, table: &str) -> Result<()> {
        self.schema.setup_change_tracking(table, self.config.sync_existing_data).await
    }

    /// Supplies the credentials the network client attaches to every
    /// request, and persists the device id as the local watermark owner.
    pub async fn authenticate(
        &self,
        project_id: impl Into<String>,
        auth_token: impl Into<String>,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<()> {
        let device_id = device_id.into();
        self.network.setup(project_id, auth_token, device_id.clone()).await;
        self.network.set_user_id(user_id).await?;
        self.change_log.ensure_device_state(device_id).await
    }

    pub fn facade(&self) -> &Arc<DatabaseFacade> {
        &self.facade
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn live_query(&self) -> &Arc<LiveQueryWatcher> {
        &self.live_query
    }

    pub fn db(&self) -> &Arc<DbExecutor> {
        &self.db
    }

    /// Starts background sync: the periodic worker sweep, the push-
    /// notification listener (each incoming notification schedules a
    /// debounced download), and the local-change bridge (each locally
    /// originated notification schedules a debounced upload for its
    /// table). Idempotent only in the sense that calling it twice spawns
    /// a second set of tasks; callers should call it once per engine.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.background_tasks.lock().await;

        tasks.push(self.worker.start_periodic_sweep());

        let mut local_changes = self.notifier.subscribe_all().await;
        let scheduler = self.scheduler.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = local_changes.recv().await {
                if let ChangeEvent::Table { table, kind, trigger_sync: true } = event {
                    scheduler.schedule_upload(&table, operation_of(kind)).await;
                }
            }
        }));

        let mut push_notifications = self.network.listen_for_remote_changes();
        let scheduler = self.scheduler.clone();
        tasks.push(tokio::spawn(async move {
            while push_notifications.recv().await.is_some() {
                scheduler.schedule_download().await;
            }
        }));
    }

    /// Bypasses the debounce windows and runs one sync cycle immediately.
    pub async fn force_sync(&self) {
        self.scheduler.force_sync_now().await;
    }

    pub fn set_online(&self, online: bool) {
        self.worker.set_online(online);
    }

    pub async fn on_connectivity_restored(&self) {
        self.worker.on_connectivity_restored().await;
    }

    /// Cancels all background tasks and pending debounce timers. The
    /// database executor thread is left running; drop the engine entirely
    /// to shut it down.
    pub async fn shutdown(&self) {
        self.notifier.dispose().await;
        let mut tasks = self.background_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_initializes_schema_and_tracks_a_table() {
        let engine = SyncEngine::open(":memory:", "http://localhost", "ws://localhost", "1", SyncConfig::default())
            .await
            .unwrap();
        engine
            .db()
            .run(|conn| {
                conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
                    .map_err(crate::error::SyncError::from)
            })
            .await
            .unwrap();
        engine.track_table("users").await.unwrap();

        let global_id = engine
            .facade()
            .insert("users", vec![("name".to_string(), serde_json::json!("Ada"))])
            .await
            .unwrap();
        assert_eq!(global_id.len(), 32);
    }
}
