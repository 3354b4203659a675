use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db_executor::DbExecutor;
use crate::error::{Result, SyncError};

/// System tables and trigger-name prefixes owned by the sync engine.
/// Reserved; user tables/triggers must never use these.
pub const CHANGES_TABLE: &str = "__sync_changes";
pub const VERSION_TABLE: &str = "__sync_version";
pub const DEVICE_STATE_TABLE: &str = "__sync_device_state";
pub const PROCESSED_CHANGES_TABLE: &str = "__sync_processed_changes";
pub const PROCESSED_TABLES_TABLE: &str = "__sync_processed_tables";
pub const TRIGGER_BACKUP_TABLE: &str = "__sync_trigger_backup";

/// One of the three mutating operations a change log entry can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(SyncError::SyncState(format!("unknown operation {other}"))),
        }
    }
}

/// Tri-state sync status for a change-log row: pending upload, uploaded,
/// or pruned (dropped because the queue exceeded its cap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Uploaded,
    Pruned,
}

impl SyncStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            SyncStatus::Pending => 0,
            SyncStatus::Uploaded => 1,
            SyncStatus::Pruned => -1,
        }
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(SyncStatus::Pending),
            1 => Ok(SyncStatus::Uploaded),
            -1 => Ok(SyncStatus::Pruned),
            other => Err(SyncError::SyncState(format!("unknown synced value {other}"))),
        }
    }
}

/// Sum type for the change-log `data` payload. Never represented as an
/// untyped JSON map at API boundaries; serializes to exactly `{old?, new?}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeData {
    Insert { new: serde_json::Value },
    Update { old: serde_json::Value, new: serde_json::Value },
    Delete { old: serde_json::Value },
}

impl ChangeData {
    pub fn new_value(&self) -> Option<&serde_json::Value> {
        match self {
            ChangeData::Insert { new } | ChangeData::Update { new, .. } => Some(new),
            ChangeData::Delete { .. } => None,
        }
    }

    pub fn old_value(&self) -> Option<&serde_json::Value> {
        match self {
            ChangeData::Update { old, .. } | ChangeData::Delete { old } => Some(old),
            ChangeData::Insert { .. } => None,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            ChangeData::Insert { .. } => Operation::Insert,
            ChangeData::Update { .. } => Operation::Update,
            ChangeData::Delete { .. } => Operation::Delete,
        }
    }
}

impl Serialize for ChangeData {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        if let Some(old) = self.old_value() {
            map.serialize_entry("old", old)?;
        }
        if let Some(new) = self.new_value() {
            map.serialize_entry("new", new)?;
        }
        map.end()
    }
}

/// Deserializes `{old?, new?}` using the entry's `operation` to disambiguate
/// an update (both present) from an insert (new only) or delete (old only).
pub fn parse_change_data(operation: Operation, raw: &serde_json::Value) -> Result<ChangeData> {
    let old = raw.get("old").cloned();
    let new = raw.get("new").cloned();
    match operation {
        Operation::Insert => Ok(ChangeData::Insert {
            new: new.ok_or_else(|| SyncError::SyncState("insert change missing new".into()))?,
        }),
        Operation::Update => Ok(ChangeData::Update {
            old: old.ok_or_else(|| SyncError::SyncState("update change missing old".into()))?,
            new: new.ok_or_else(|| SyncError::SyncState("update change missing new".into()))?,
        }),
        Operation::Delete => Ok(ChangeData::Delete {
            old: old.ok_or_else(|| SyncError::SyncState("delete change missing old".into()))?,
        }),
    }
}

/// A durable change-log row: the engine's record of one local mutation.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub timestamp: i64,
    pub version: i64,
    pub data: ChangeData,
    pub synced: SyncStatus,
}

impl ChangeLogEntry {
    pub fn operation(&self) -> Operation {
        self.data.operation()
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, i64, i64, String, i64)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }
}

/// Per-device sync watermarks, a singleton row.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub device_id: String,
    pub last_upload_timestamp: i64,
    pub last_download_timestamp: i64,
    pub last_sync_status: Option<String>,
    pub last_cleanup_timestamp: i64,
}

/// Stored plugin version, driving one-shot reset on upgrade.
#[derive(Debug, Clone)]
pub struct PluginVersion {
    pub version: String,
    pub last_reset_timestamp: i64,
}

const SELECT_COLS: &str =
    "id, table_name, record_id, timestamp, version, data, synced";

/// Durable, append-only record of local mutations plus the device/version
/// singletons the rest of the engine keys off of. Mutation after insertion
/// is limited to the `synced` tri-state.
pub struct ChangeLogStore {
    db: Arc<DbExecutor>,
}

impl ChangeLogStore {
    pub fn new(db: Arc<DbExecutor>) -> Self {
        Self { db }
    }

    /// Creates the system tables and their indexes if absent. Idempotent.
    pub async fn init(&self) -> Result<()> {
        self.db
            .run(|conn| {
                conn.execute_batch(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {changes} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        table_name TEXT NOT NULL,
                        record_id TEXT NOT NULL,
                        operation TEXT NOT NULL CHECK(operation IN ('INSERT','UPDATE','DELETE')),
                        timestamp INTEGER NOT NULL,
                        version INTEGER NOT NULL,
                        data TEXT NOT NULL,
                        synced INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX IF NOT EXISTS idx_{changes}_synced ON {changes}(synced);
                    CREATE INDEX IF NOT EXISTS idx_{changes}_version ON {changes}(table_name, record_id, version);
                    CREATE INDEX IF NOT EXISTS idx_{changes}_timestamp ON {changes}(timestamp);
                    CREATE INDEX IF NOT EXISTS idx_{changes}_table_name ON {changes}(table_name);
                    CREATE INDEX IF NOT EXISTS idx_{changes}_record_id ON {changes}(record_id);

                    CREATE TABLE IF NOT EXISTS {version} (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        version TEXT NOT NULL,
                        last_reset_timestamp INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE TABLE IF NOT EXISTS {device_state} (
                        id INTEGER PRIMARY KEY CHECK (id = 1),
                        device_id TEXT NOT NULL,
                        last_upload_timestamp INTEGER NOT NULL DEFAULT 0,
                        last_download_timestamp INTEGER NOT NULL DEFAULT 0,
                        last_sync_status TEXT,
                        last_cleanup_timestamp INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE TABLE IF NOT EXISTS {processed_changes} (
                        remote_id TEXT PRIMARY KEY
                    );

                    CREATE TABLE IF NOT EXISTS {processed_tables} (
                        table_name TEXT PRIMARY KEY
                    );

                    CREATE TABLE IF NOT EXISTS {trigger_backup} (
                        table_name TEXT PRIMARY KEY,
                        installed_at INTEGER NOT NULL
                    );
                    "#,
                    changes = CHANGES_TABLE,
                    version = VERSION_TABLE,
                    device_state = DEVICE_STATE_TABLE,
                    processed_changes = PROCESSED_CHANGES_TABLE,
                    processed_tables = PROCESSED_TABLES_TABLE,
                    trigger_backup = TRIGGER_BACKUP_TABLE,
                ))
                .map_err(SyncError::from)
            })
            .await
    }

    /// Ensures the device-state singleton exists for `device_id`.
    pub async fn ensure_device_state(&self, device_id: String) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {t} (id, device_id) VALUES (1, ?1)
                         ON CONFLICT(id) DO NOTHING",
                        t = DEVICE_STATE_TABLE
                    ),
                    params![device_id],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }

    pub async fn device_state(&self) -> Result<DeviceState> {
        self.db
            .run(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT device_id, last_upload_timestamp, last_download_timestamp,
                                last_sync_status, last_cleanup_timestamp
                         FROM {t} WHERE id = 1",
                        t = DEVICE_STATE_TABLE
                    ),
                    [],
                    |row| {
                        Ok(DeviceState {
                            device_id: row.get(0)?,
                            last_upload_timestamp: row.get(1)?,
                            last_download_timestamp: row.get(2)?,
                            last_sync_status: row.get(3)?,
                            last_cleanup_timestamp: row.get(4)?,
                        })
                    },
                )
                .map_err(SyncError::from)
            })
            .await
    }

    pub async fn set_last_upload_timestamp(&self, ts: i64) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!("UPDATE {t} SET last_upload_timestamp = ?1 WHERE id = 1", t = DEVICE_STATE_TABLE),
                    params![ts],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }

    /// Advances `last_download_timestamp`. Monotonic: callers pass the
    /// server-reported timestamp on every successful download, including
    /// zero-change responses, per the resolved Open Question.
    pub async fn set_last_download_timestamp(&self, ts: i64) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE {t} SET last_download_timestamp = ?1 WHERE id = 1 AND last_download_timestamp <= ?1",
                        t = DEVICE_STATE_TABLE
                    ),
                    params![ts],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }

    pub async fn set_last_sync_status(&self, status: String) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!("UPDATE {t} SET last_sync_status = ?1 WHERE id = 1", t = DEVICE_STATE_TABLE),
                    params![status],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }

    pub async fn set_last_cleanup_timestamp(&self, ts: i64) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!("UPDATE {t} SET last_cleanup_timestamp = ?1 WHERE id = 1", t = DEVICE_STATE_TABLE),
                    params![ts],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }

    pub async fn plugin_version(&self) -> Result<Option<PluginVersion>> {
        self.db
            .run(|conn| {
                conn.query_row(
                    &format!("SELECT version, last_reset_timestamp FROM {t} WHERE id = 1", t = VERSION_TABLE),
                    [],
                    |row| {
                        Ok(PluginVersion {
                            version: row.get(0)?,
                            last_reset_timestamp: row.get(1)?,
                        })
                    },
                )
                .optional()
                .map_err(SyncError::from)
            })
            .await
    }

    pub async fn set_plugin_version(&self, version: String, reset_timestamp: i64) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {t} (id, version, last_reset_timestamp) VALUES (1, ?1, ?2)
                         ON CONFLICT(id) DO UPDATE SET version = excluded.version,
                                                        last_reset_timestamp = excluded.last_reset_timestamp",
                        t = VERSION_TABLE
                    ),
                    params![version, reset_timestamp],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }

    /// All rows with `synced = 0` (Pending) for a table, ordered by
    /// `(record_id, timestamp ASC)` as the aggregator requires.
    pub async fn pending_for_table(&self, table: String) -> Result<Vec<ChangeLogEntry>> {
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {cols} FROM {t}
                     WHERE table_name = ?1 AND synced = 0
                     ORDER BY record_id ASC, timestamp ASC",
                    cols = SELECT_COLS,
                    t = CHANGES_TABLE
                ))?;
                let rows = stmt
                    .query_map(params![table], ChangeLogEntry::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(entry_from_tuple).collect::<Result<Vec<_>>>()
            })
            .await
    }

    /// Pending local changes (synced=0) for specific `(table, record_id)`
    /// pairs, used by the worker to find locally-conflicting edits before
    /// merging a remote batch.
    pub async fn pending_for_records(&self, keys: Vec<(String, String)>) -> Result<Vec<ChangeLogEntry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .run(move |conn| {
                let mut out = Vec::new();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {cols} FROM {t}
                     WHERE table_name = ?1 AND record_id = ?2 AND synced = 0
                     ORDER BY timestamp ASC",
                    cols = SELECT_COLS,
                    t = CHANGES_TABLE
                ))?;
                for (table, record_id) in &keys {
                    let rows = stmt
                        .query_map(params![table, record_id], ChangeLogEntry::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    for row in rows {
                        out.push(entry_from_tuple(row)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Marks a set of change-log ids `synced = 1` (Uploaded).
    pub async fn mark_uploaded(&self, ids: Vec<i64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        &format!("UPDATE {t} SET synced = 1 WHERE id = ?1", t = CHANGES_TABLE),
                        params![id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Enforces `queue_cap`: if pending rows exceed the cap, the oldest
    /// ones beyond the cap (by `timestamp DESC`, i.e. the stalest) are
    /// demoted to `synced = -1` (Pruned). Returns the number pruned.
    pub async fn prune_if_over_cap(&self, cap: i64) -> Result<usize> {
        self.db
            .run(move |conn| {
                let pending: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {t} WHERE synced = 0", t = CHANGES_TABLE),
                    [],
                    |row| row.get(0),
                )?;
                if pending <= cap {
                    return Ok(0);
                }
                let to_prune = pending - cap;
                let pruned = conn.execute(
                    &format!(
                        "UPDATE {t} SET synced = -1 WHERE id IN (
                            SELECT id FROM {t} WHERE synced = 0
                            ORDER BY timestamp DESC LIMIT -1 OFFSET ?1
                        )",
                        t = CHANGES_TABLE
                    ),
                    params![cap],
                )?;
                debug_assert!(pruned as i64 <= to_prune);
                Ok(pruned)
            })
            .await
    }

    /// Deletes uploaded rows older than the retention horizon. Callers are
    /// responsible for enforcing the "at most once per 24h" cadence.
    pub async fn prune_retention(&self, older_than: i64) -> Result<usize> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "DELETE FROM {t} WHERE synced = 1 AND timestamp < ?1",
                        t = CHANGES_TABLE
                    ),
                    params![older_than],
                )
                .map_err(SyncError::from)
            })
            .await
    }

    pub async fn has_processed(&self, remote_id: String) -> Result<bool> {
        self.db
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT 1 FROM {t} WHERE remote_id = ?1", t = PROCESSED_CHANGES_TABLE),
                    params![remote_id],
                    |_| Ok(()),
                )
                .optional()
                .map(|o| o.is_some())
                .map_err(SyncError::from)
            })
            .await
    }

    /// Records `remote_id` as processed within the same transaction `tx`
    /// as the data application, giving crash-safe idempotency.
    pub fn mark_processed_in_tx(tx: &rusqlite::Transaction<'_>, remote_id: &str) -> Result<()> {
        tx.execute(
            &format!(
                "INSERT INTO {t} (remote_id) VALUES (?1) ON CONFLICT(remote_id) DO NOTHING",
                t = PROCESSED_CHANGES_TABLE
            ),
            params![remote_id],
        )?;
        Ok(())
    }

    pub async fn is_table_processed(&self, table: String) -> Result<bool> {
        self.db
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT 1 FROM {t} WHERE table_name = ?1", t = PROCESSED_TABLES_TABLE),
                    params![table],
                    |_| Ok(()),
                )
                .optional()
                .map(|o| o.is_some())
                .map_err(SyncError::from)
            })
            .await
    }

    pub async fn mark_table_processed(&self, table: String) -> Result<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {t} (table_name) VALUES (?1) ON CONFLICT(table_name) DO NOTHING",
                        t = PROCESSED_TABLES_TABLE
                    ),
                    params![table],
                )
                .map_err(SyncError::from)?;
                Ok(())
            })
            .await
    }
}

fn entry_from_tuple(row: (i64, String, String, i64, i64, String, i64)) -> Result<ChangeLogEntry> {
    let (id, table_name, record_id, timestamp, version, data_raw, synced) = row;
    // `operation` isn't selected directly; it's reconstructed along with
    // `data` since `ChangeData` carries the operation tag implicitly.
    let value: serde_json::Value = serde_json::from_str(&data_raw)?;
    let has_old = value.get("old").is_some();
    let has_new = value.get("new").is_some();
    let operation = match (has_old, has_new) {
        (false, true) => Operation::Insert,
        (true, true) => Operation::Update,
        (true, false) => Operation::Delete,
        (false, false) => {
            return Err(SyncError::SyncState(format!("change {id} has neither old nor new")))
        }
    };
    Ok(ChangeLogEntry {
        id,
        table_name,
        record_id,
        timestamp,
        version,
        data: parse_change_data(operation, &value)?,
        synced: SyncStatus::from_i64(synced)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_schema() -> ChangeLogStore {
        let db = Arc::new(DbExecutor::open_in_memory().unwrap());
        let store = ChangeLogStore::new(db);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = store_with_schema().await;
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn device_state_roundtrip() {
        let store = store_with_schema().await;
        store.ensure_device_state("device-1".into()).await.unwrap();
        store.set_last_upload_timestamp(100).await.unwrap();
        store.set_last_download_timestamp(200).await.unwrap();
        let state = store.device_state().await.unwrap();
        assert_eq!(state.device_id, "device-1");
        assert_eq!(state.last_upload_timestamp, 100);
        assert_eq!(state.last_download_timestamp, 200);
    }

    #[tokio::test]
    async fn download_timestamp_is_monotonic() {
        let store = store_with_schema().await;
        store.ensure_device_state("device-1".into()).await.unwrap();
        store.set_last_download_timestamp(500).await.unwrap();
        store.set_last_download_timestamp(100).await.unwrap();
        let state = store.device_state().await.unwrap();
        assert_eq!(state.last_download_timestamp, 500);
    }

    #[tokio::test]
    async fn prune_over_cap_demotes_oldest() {
        let store = store_with_schema().await;
        store
            .db
            .run(|conn| {
                for i in 0..5i64 {
                    conn.execute(
                        &format!(
                            "INSERT INTO {t} (table_name, record_id, operation, timestamp, version, data, synced)
                             VALUES ('t','r{i}','INSERT',{i},1,'{{\"new\":{{}}}}',0)",
                            t = CHANGES_TABLE
                        ),
                        [],
                    )?;
                }
                Ok(())
            })
            .await
            .unwrap();
        let pruned = store.prune_if_over_cap(3).await.unwrap();
        assert_eq!(pruned, 2);
        let remaining = store.pending_for_table("t".to_string()).await.unwrap();
        assert_eq!(remaining.len(), 3);
    }
}
