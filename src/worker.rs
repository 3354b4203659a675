use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::params_from_iter;

use crate::aggregator::ChangeAggregator;
use crate::change_log::{ChangeLogStore, Operation};
use crate::config::SyncConfig;
use crate::db_executor::DbExecutor;
use crate::error::{Result, SyncError};
use crate::facade::json_value_to_sql;
use crate::merge::{MergeCandidate, MergeEngine};
use crate::network::{NetworkClient, RemoteChange, WireChange};
use crate::notifier::{ChangeKind, ChangeNotifier};
use crate::queue::SyncQueue;
use crate::schema::SchemaManager;

fn change_kind_of(op: Operation) -> ChangeKind {
    match op {
        Operation::Insert => ChangeKind::Insert,
        Operation::Update => ChangeKind::Update,
        Operation::Delete => ChangeKind::Delete,
    }
}

/// Drains the sync queue: uploads locally-aggregated changes table by
/// table, then downloads and applies the server's remote batch, merging
/// it against any still-pending local edits on the same records. Runs at
/// most one cycle at a time; a second call while one is in flight is a
/// no-op, matching the queue/scheduler contract that only one upload and
/// one download run concurrently.
pub struct SyncWorker {
    db: Arc<DbExecutor>,
    change_log: Arc<ChangeLogStore>,
    schema: Arc<SchemaManager>,
    aggregator: Arc<ChangeAggregator>,
    queue: Arc<SyncQueue>,
    network: Arc<NetworkClient>,
    merge_engine: Arc<MergeEngine>,
    notifier: Arc<ChangeNotifier>,
    config: SyncConfig,
    syncing: AtomicBool,
    online: Arc<AtomicBool>,
}

impl SyncWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DbExecutor>,
        change_log: Arc<ChangeLogStore>,
        schema: Arc<SchemaManager>,
        aggregator: Arc<ChangeAggregator>,
        queue: Arc<SyncQueue>,
        network: Arc<NetworkClient>,
        merge_engine: Arc<MergeEngine>,
        notifier: Arc<ChangeNotifier>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            change_log,
            schema,
            aggregator,
            queue,
            network,
            merge_engine,
            notifier,
            config,
            syncing: AtomicBool::new(false),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Entry point invoked by the scheduler. Single-flight; a no-op while
    /// offline or while another cycle is already running.
    pub async fn process_queue(&self) -> Result<()> {
        if !self.is_online() {
            return Ok(());
        }
        if self.queue.is_empty().await {
            return Ok(());
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.run_cycle().await;
        self.syncing.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            tracing::warn!(error = %e, "sync cycle failed");
            let _ = self.change_log.set_last_sync_status("error".to_string()).await;
        } else {
            let _ = self.change_log.set_last_sync_status("ok".to_string()).await;
        }
        self.notifier.notify_sync().await;
        result
    }

    async fn run_cycle(&self) -> Result<()> {
        self.upload_pending().await;
        self.download_and_merge().await?;
        self.prune_if_needed().await?;
        Ok(())
    }

    /// Uploads every table with pending local changes. A table whose
    /// upload fails (network returns `false`) is skipped, leaving it
    /// queued for the next cycle; other tables still proceed.
    async fn upload_pending(&self) {
        let tables = self.queue.pending_upload_tables().await;
        for table in tables {
            if let Err(e) = self.upload_table(&table).await {
                tracing::warn!(table = %table, error = %e, "failed to aggregate/upload table");
            }
        }
    }

    async fn upload_table(&self, table: &str) -> Result<()> {
        let aggregation = self.aggregator.aggregate(table).await?;
        if aggregation.changes.is_empty() {
            self.change_log.mark_uploaded(aggregation.affected_ids).await?;
            self.queue.mark_table_uploaded(table).await;
            return Ok(());
        }

        let mut all_batches_ok = true;
        for batch in aggregation.changes.chunks(self.config.max_batch_size) {
            let wire: Vec<WireChange> = batch.iter().map(WireChange::from).collect();
            match self.network.upload_changes(&wire).await {
                Ok(true) => {}
                Ok(false) => {
                    all_batches_ok = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if all_batches_ok {
            self.change_log.mark_uploaded(aggregation.affected_ids).await?;
            self.queue.mark_table_uploaded(table).await;
            self.change_log.set_last_upload_timestamp(now_ms()).await?;
        }
        Ok(())
    }

    /// Downloads the remote batch since the last watermark, merges it
    /// against any conflicting local edits, applies the result with
    /// triggers suppressed, and advances the download watermark. The
    /// watermark always advances on a successful download, even with zero
    /// new changes, per the monotonic-cursor design.
    async fn download_and_merge(&self) -> Result<()> {
        let since = self.change_log.device_state().await?.last_download_timestamp;
        let response = self.network.download_changes(since).await?;

        let mut new_changes = Vec::with_capacity(response.changes.len());
        for change in response.changes {
            if !self.change_log.has_processed(change.remote_id.clone()).await? {
                new_changes.push(change);
            }
        }

        if new_changes.is_empty() {
            self.change_log.set_last_download_timestamp(response.timestamp).await?;
            self.queue.mark_download_processed().await;
            return Ok(());
        }

        let keys: Vec<(String, String)> = {
            let mut seen = HashSet::new();
            new_changes
                .iter()
                .filter_map(|c| {
                    let key = (c.change.table_name.clone(), c.change.record_id.clone());
                    seen.insert(key.clone()).then_some(key)
                })
                .collect()
        };
        let local_raw = self.change_log.pending_for_records(keys).await?;
        let local_agg = ChangeAggregator::aggregate_entries(local_raw).changes;

        let sync_session_id = response.sync_session_id.clone();
        let outcome = self.merge_engine.merge(&local_agg, &new_changes, &sync_session_id);

        let affected_tables: Vec<String> = {
            let mut seen = HashSet::new();
            outcome
                .changes
                .iter()
                .filter_map(|c| seen.insert(c.table_name.clone()).then(|| c.table_name.clone()))
                .collect()
        };

        for table in &affected_tables {
            self.schema.drop_sync_triggers(table).await?;
        }

        let apply_result = self.apply_merged_changes(&outcome.changes, &new_changes).await;

        for table in &affected_tables {
            // Triggers are re-enabled unconditionally, even if applying
            // the batch failed partway.
            if let Err(e) = self.schema.restore_triggers(std::slice::from_ref(table)).await {
                tracing::warn!(table = %table, error = %e, "failed to restore sync triggers");
            }
        }
        apply_result?;

        for conflict in &outcome.conflicts {
            self.network
                .report_conflict(
                    conflict.strategy.clone(),
                    &conflict.local.table_name,
                    &conflict.local.record_id,
                    &conflict.local.data,
                    &conflict.remote.data,
                    &conflict.winner.data,
                    &conflict.sync_session_id,
                )
                .await;
        }

        self.change_log.set_last_download_timestamp(response.timestamp).await?;
        self.queue.mark_download_processed().await;

        for table in &affected_tables {
            self.notifier.notify_with_flag(table, ChangeKind::Update, false).await;
        }
        Ok(())
    }

    async fn apply_merged_changes(&self, changes: &[MergeCandidate], remote_batch: &[RemoteChange]) -> Result<()> {
        let changes = changes.to_vec();
        let remote_ids: Vec<String> = remote_batch.iter().map(|c| c.remote_id.clone()).collect();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                for change in &changes {
                    apply_one(&tx, change)?;
                }
                for remote_id in &remote_ids {
                    ChangeLogStore::mark_processed_in_tx(&tx, remote_id)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Drops pending rows beyond `queue_cap`, demoting the stalest to
    /// `Pruned` so they stop counting as pending without ever being
    /// re-uploaded.
    async fn prune_if_needed(&self) -> Result<()> {
        let pruned = self.change_log.prune_if_over_cap(self.config.queue_cap).await?;
        if pruned > 0 {
            tracing::warn!(pruned, "change log queue cap exceeded, oldest pending rows pruned");
        }
        Ok(())
    }

    /// Spawns the periodic sweep task: a best-effort `process_queue` every
    /// `periodic_sync_interval`, independent of the debounced scheduler
    /// path, so changes made while offline still eventually sync once
    /// connectivity and the timer line up.
    pub fn start_periodic_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = self.clone();
        let interval = self.config.periodic_sync_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = worker.process_queue().await {
                    tracing::warn!(error = %e, "periodic sync sweep failed");
                }
            }
        })
    }

    /// Called when connectivity is restored; triggers an immediate drain
    /// rather than waiting for the next periodic sweep.
    pub async fn on_connectivity_restored(&self) {
        self.set_online(true);
        if let Err(e) = self.process_queue().await {
            tracing::warn!(error = %e, "sync after connectivity restored failed");
        }
    }
}

fn apply_one(tx: &rusqlite::Transaction<'_>, change: &MergeCandidate) -> Result<()> {
    match change.operation {
        Operation::Insert | Operation::Update => {
            let new_obj = change
                .data
                .get("new")
                .and_then(|v| v.as_object())
                .ok_or_else(|| SyncError::SyncState("merged change missing new row".into()))?;
            let cols: Vec<&String> = new_obj.keys().collect();
            let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
            let sets: Vec<String> = cols
                .iter()
                .filter(|c| c.as_str() != "global_id")
                .map(|c| format!("{c} = excluded.{c}"))
                .collect();
            let sql = format!(
                "INSERT INTO {table} ({cols}) VALUES ({vals}) ON CONFLICT(global_id) DO UPDATE SET {sets}",
                table = change.table_name,
                cols = cols.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
                vals = placeholders.join(", "),
                sets = sets.join(", "),
            );
            let params: Vec<rusqlite::types::Value> = cols.iter().map(|c| json_value_to_sql(&new_obj[*c])).collect();
            tx.execute(&sql, params_from_iter(params))?;
        }
        Operation::Delete => {
            tx.execute(
                &format!("DELETE FROM {table} WHERE global_id = ?1", table = change.table_name),
                rusqlite::params![change.record_id],
            )?;
        }
    }
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Origin;

    #[test]
    fn apply_one_upserts_on_conflict() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (global_id TEXT PRIMARY KEY, name TEXT)").unwrap();
        let tx = conn.transaction().unwrap();
        let change = MergeCandidate {
            origin: Origin::Remote,
            table_name: "users".into(),
            record_id: "g1".into(),
            operation: Operation::Insert,
            timestamp: 1,
            version: 1,
            data: serde_json::json!({"new": {"global_id": "g1", "name": "Ada"}}),
            remote_id: Some("r1".into()),
        };
        apply_one(&tx, &change).unwrap();
        tx.commit().unwrap();

        let name: String = conn.query_row("SELECT name FROM users WHERE global_id='g1'", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "Ada");
    }

    #[test]
    fn apply_one_deletes() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (global_id TEXT PRIMARY KEY, name TEXT)").unwrap();
        conn.execute("INSERT INTO users (global_id, name) VALUES ('g1', 'Ada')", []).unwrap();
        let tx = conn.transaction().unwrap();
        let change = MergeCandidate {
            origin: Origin::Remote,
            table_name: "users".into(),
            record_id: "g1".into(),
            operation: Operation::Delete,
            timestamp: 1,
            version: 1,
            data: serde_json::json!({"old": {"global_id": "g1", "name": "Ada"}}),
            remote_id: Some("r1".into()),
        };
        apply_one(&tx, &change).unwrap();
        tx.commit().unwrap();

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
