use std::sync::Arc;

use rusqlite::params;

use crate::change_log::{ChangeLogStore, CHANGES_TABLE, TRIGGER_BACKUP_TABLE};
use crate::db_executor::DbExecutor;
use crate::error::Result;

/// Identifier prefixes reserved for sync internals, engine internals, and
/// common embedded-platform scratch tables. A table whose name starts with
/// one of these is never treated as a user table.
const RESERVED_PREFIXES: &[&str] = &["__sync_", "sqlite_", "android_metadata", "room_"];

pub fn is_user_table(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !RESERVED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn trigger_name(kind: &str, table: &str) -> String {
    format!("after_{kind}_{table}")
}

/// Builds the three sync-owned trigger bodies for one table from its
/// introspected (non-`global_id`) column list. Emitted once per table on
/// `setup_change_tracking`, never string-templated ad hoc at call sites.
struct TriggerSpec<'a> {
    table: &'a str,
    columns: &'a [String],
}

impl<'a> TriggerSpec<'a> {
    fn json_object(&self, prefix: &str) -> String {
        let mut parts = Vec::with_capacity(self.columns.len() + 1);
        parts.push("'global_id', global_id".to_string());
        for col in self.columns {
            parts.push(format!("'{col}', {prefix}.{col}"));
        }
        format!("json_object({})", parts.join(", "))
    }

    fn insert_trigger_sql(&self) -> String {
        let new_row_json = self.json_object("NEW");
        format!(
            r#"CREATE TRIGGER {name}
AFTER INSERT ON {table}
BEGIN
  UPDATE {table} SET global_id = lower(hex(randomblob(16)))
    WHERE rowid = NEW.rowid AND global_id IS NULL;
  INSERT INTO {changes} (table_name, record_id, operation, timestamp, version, data, synced)
  VALUES (
    '{table}', (SELECT global_id FROM {table} WHERE rowid = NEW.rowid), 'INSERT',
    CAST(strftime('%s','now') AS INTEGER) * 1000, 1,
    json_object('new', (SELECT {new_row_json} FROM {table} WHERE rowid = NEW.rowid)),
    0
  );
END;"#,
            name = trigger_name("insert", self.table),
            table = self.table,
            changes = CHANGES_TABLE,
        )
    }

    fn update_trigger_sql(&self) -> String {
        let when_clause = self
            .columns
            .iter()
            .map(|c| format!("OLD.{c} IS NOT NEW.{c}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let when_clause = if when_clause.is_empty() {
            "0".to_string()
        } else {
            when_clause
        };
        let old_row_json = self.json_object("OLD");
        let new_row_json = self.json_object("NEW");
        format!(
            r#"CREATE TRIGGER {name}
AFTER UPDATE ON {table}
WHEN {when_clause}
BEGIN
  UPDATE {table} SET global_id = COALESCE(NEW.global_id, OLD.global_id, lower(hex(randomblob(16))))
    WHERE rowid = NEW.rowid AND global_id IS NULL;
  INSERT INTO {changes} (table_name, record_id, operation, timestamp, version, data, synced)
  VALUES (
    '{table}',
    (SELECT global_id FROM {table} WHERE rowid = NEW.rowid),
    'UPDATE',
    CAST(strftime('%s','now') AS INTEGER) * 1000,
    (SELECT COALESCE(MAX(version), 0) + 1 FROM {changes}
       WHERE table_name = '{table}' AND record_id = (SELECT global_id FROM {table} WHERE rowid = NEW.rowid)),
    json_object('old', {old_row_json}, 'new', (SELECT {new_row_json} FROM {table} WHERE rowid = NEW.rowid)),
    0
  );
END;"#,
            name = trigger_name("update", self.table),
            table = self.table,
            changes = CHANGES_TABLE,
        )
    }

    fn delete_trigger_sql(&self) -> String {
        let old_row_json = self.json_object("OLD");
        format!(
            r#"CREATE TRIGGER {name}
AFTER DELETE ON {table}
BEGIN
  INSERT INTO {changes} (table_name, record_id, operation, timestamp, version, data, synced)
  VALUES (
    '{table}',
    COALESCE(OLD.global_id, lower(hex(randomblob(16)))),
    'DELETE',
    CAST(strftime('%s','now') AS INTEGER) * 1000,
    (SELECT COALESCE(MAX(version), 0) + 1 FROM {changes}
       WHERE table_name = '{table}' AND record_id = COALESCE(OLD.global_id, '')),
    json_object('old', {old_row_json}),
    0
  );
END;"#,
            name = trigger_name("delete", self.table),
            table = self.table,
            changes = CHANGES_TABLE,
        )
    }
}

/// Provisions and maintains all sync-owned schema artifacts: system
/// tables (delegated to `ChangeLogStore::init`), the per-table `global_id`
/// column/index/backfill, and the three change-capture triggers.
pub struct SchemaManager {
    db: Arc<DbExecutor>,
    change_log: Arc<ChangeLogStore>,
    current_version: String,
}

impl SchemaManager {
    pub fn new(db: Arc<DbExecutor>, change_log: Arc<ChangeLogStore>, current_version: impl Into<String>) -> Self {
        Self { db, change_log, current_version: current_version.into() }
    }

    /// Creates system tables, then resets to a clean state if the stored
    /// plugin version doesn't match `current_version`.
    pub async fn initialize(&self) -> Result<()> {
        self.change_log.init().await?;
        self.maybe_reset().await
    }

    /// When the stored plugin version differs from `current_version`, drops
    /// all system tables and re-initializes, then re-installs triggers for
    /// every previously-tracked table. Runs at most once per version: a
    /// matching stored version is a no-op. On error, triggers already
    /// dropped during the reset are re-installed before the error
    /// propagates, so the database is never left with triggers disabled.
    async fn maybe_reset(&self) -> Result<()> {
        let stored = self.change_log.plugin_version().await?;
        if let Some(stored) = &stored {
            if stored.version == self.current_version {
                return Ok(());
            }
        }

        let tracked_tables = self.tracked_tables().await?;
        let reset_result = self.perform_reset(&tracked_tables).await;
        if reset_result.is_err() {
            // Leave triggers re-enabled even if the reset failed partway.
            for table in &tracked_tables {
                let _ = self.setup_change_tracking(table, false).await;
            }
        }
        reset_result?;

        let now = chrono::Utc::now().timestamp_millis();
        self.change_log.set_plugin_version(self.current_version.clone(), now).await
    }

    async fn perform_reset(&self, tracked_tables: &[String]) -> Result<()> {
        for table in tracked_tables {
            self.drop_sync_triggers(table).await?;
        }
        self.drop_all_system_tables().await?;
        self.change_log.init().await?;
        for table in tracked_tables {
            self.setup_change_tracking(table, true).await?;
        }
        Ok(())
    }

    async fn tracked_tables(&self) -> Result<Vec<String>> {
        self.db
            .run(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT table_name FROM {t}",
                    t = crate::change_log::PROCESSED_TABLES_TABLE
                ))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    async fn drop_all_system_tables(&self) -> Result<()> {
        use crate::change_log::*;
        self.db
            .run(|conn| {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {c}; DROP TABLE IF EXISTS {v}; DROP TABLE IF EXISTS {d};
                     DROP TABLE IF EXISTS {p}; DROP TABLE IF EXISTS {pt}; DROP TABLE IF EXISTS {tb};",
                    c = CHANGES_TABLE,
                    v = VERSION_TABLE,
                    d = DEVICE_STATE_TABLE,
                    p = PROCESSED_CHANGES_TABLE,
                    pt = PROCESSED_TABLES_TABLE,
                    tb = TRIGGER_BACKUP_TABLE,
                ))
                .map_err(crate::error::SyncError::from)
            })
            .await
    }

    /// Idempotent per-table setup: adds `global_id`, indexes it, back-fills
    /// existing rows, and (re)installs the three triggers.
    pub async fn setup_change_tracking(&self, table: &str, sync_existing_data: bool) -> Result<()> {
        let table = table.to_string();
        let columns = self.non_global_id_columns(&table).await?;

        self.db
            .run({
                let table = table.clone();
                let columns = columns.clone();
                move |conn| {
                    let has_global_id = conn
                        .prepare(&format!("PRAGMA table_info({table})"))?
                        .query_map([], |row| row.get::<_, String>(1))?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                        .iter()
                        .any(|c| c == "global_id");
                    if !has_global_id {
                        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN global_id TEXT"), [])?;
                    }
                    conn.execute(
                        &format!("CREATE INDEX IF NOT EXISTS idx_{table}_global_id ON {table}(global_id)"),
                        [],
                    )?;
                    conn.execute(
                        &format!("UPDATE {table} SET global_id = lower(hex(randomblob(16))) WHERE global_id IS NULL"),
                        [],
                    )?;

                    conn.execute(&format!("DROP TRIGGER IF EXISTS {}", trigger_name("insert", &table)), [])?;
                    conn.execute(&format!("DROP TRIGGER IF EXISTS {}", trigger_name("update", &table)), [])?;
                    conn.execute(&format!("DROP TRIGGER IF EXISTS {}", trigger_name("delete", &table)), [])?;

                    let spec = TriggerSpec { table: &table, columns: &columns };
                    conn.execute_batch(&spec.insert_trigger_sql())?;
                    conn.execute_batch(&spec.update_trigger_sql())?;
                    conn.execute_batch(&spec.delete_trigger_sql())?;

                    conn.execute(
                        &format!(
                            "INSERT INTO {tb} (table_name, installed_at) VALUES (?1, CAST(strftime('%s','now') AS INTEGER) * 1000)
                             ON CONFLICT(table_name) DO UPDATE SET installed_at = excluded.installed_at",
                            tb = TRIGGER_BACKUP_TABLE
                        ),
                        params![table],
                    )?;
                    Ok(())
                }
            })
            .await?;

        self.change_log.mark_table_processed(table.clone()).await?;

        if sync_existing_data && !self.change_log.is_table_processed(table.clone()).await? {
            self.backfill_existing_rows(&table, &columns).await?;
        }
        Ok(())
    }

    /// Drops the three sync-owned triggers for a table without touching
    /// user data. Used while the worker applies remote changes and during
    /// a version reset.
    pub async fn drop_sync_triggers(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.db
            .run(move |conn| {
                conn.execute(&format!("DROP TRIGGER IF EXISTS {}", trigger_name("insert", &table)), [])?;
                conn.execute(&format!("DROP TRIGGER IF EXISTS {}", trigger_name("update", &table)), [])?;
                conn.execute(&format!("DROP TRIGGER IF EXISTS {}", trigger_name("delete", &table)), [])?;
                Ok(())
            })
            .await
    }

    /// Re-creates the three triggers for a set of tables without touching
    /// `global_id`/index/backfill, used to re-enable capture after the
    /// worker finishes applying remote changes.
    pub async fn restore_triggers(&self, tables: &[String]) -> Result<()> {
        for table in tables {
            self.setup_change_tracking(table, false).await?;
        }
        Ok(())
    }

    async fn non_global_id_columns(&self, table: &str) -> Result<Vec<String>> {
        let table = table.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
                let cols = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .into_iter()
                    .filter(|c| c != "global_id")
                    .collect();
                Ok(cols)
            })
            .await
    }

    /// One-shot back-fill: every pre-existing row in `table` becomes a
    /// synthetic INSERT log entry, at version 1, guarded by
    /// `ProcessedTables` so it never runs twice.
    async fn backfill_existing_rows(&self, table: &str, columns: &[String]) -> Result<()> {
        let table = table.to_string();
        let columns = columns.to_vec();
        self.db
            .run(move |conn| {
                let spec = TriggerSpec { table: &table, columns: &columns };
                let new_row_json = spec.json_object("t");
                conn.execute(
                    &format!(
                        "INSERT INTO {changes} (table_name, record_id, operation, timestamp, version, data, synced)
                         SELECT '{table}', t.global_id, 'INSERT',
                                CAST(strftime('%s','now') AS INTEGER) * 1000, 1,
                                json_object('new', {new_row_json}), 0
                         FROM {table} t WHERE t.global_id IS NOT NULL",
                        changes = CHANGES_TABLE,
                        table = table,
                    ),
                    [],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_are_excluded() {
        assert!(!is_user_table("__sync_changes"));
        assert!(!is_user_table("sqlite_master"));
        assert!(!is_user_table("android_metadata"));
        assert!(is_user_table("users"));
        assert!(is_user_table("trips"));
    }

    async fn manager_with_table() -> (SchemaManager, Arc<DbExecutor>) {
        let db = Arc::new(DbExecutor::open_in_memory().unwrap());
        let change_log = Arc::new(ChangeLogStore::new(db.clone()));
        let manager = SchemaManager::new(db.clone(), change_log, "1");
        manager.initialize().await.unwrap();
        db.run(|conn| {
            conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, email TEXT)")
                .map_err(crate::error::SyncError::from)
        })
        .await
        .unwrap();
        (manager, db)
    }

    #[tokio::test]
    async fn setup_adds_global_id_and_triggers() {
        let (manager, db) = manager_with_table().await;
        manager.setup_change_tracking("users", true).await.unwrap();

        let has_global_id: bool = db
            .run(|conn| {
                Ok(conn
                    .prepare("PRAGMA table_info(users)")
                    .unwrap()
                    .query_map([], |row| row.get::<_, String>(1))
                    .unwrap()
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .unwrap()
                    .iter()
                    .any(|c| c == "global_id"))
            })
            .await
            .unwrap();
        assert!(has_global_id);
    }

    #[tokio::test]
    async fn insert_trigger_logs_a_change() {
        let (manager, db) = manager_with_table().await;
        manager.setup_change_tracking("users", true).await.unwrap();
        db.run(|conn| {
            conn.execute("INSERT INTO users (name, email) VALUES ('A', 'a@x')", [])
                .map_err(crate::error::SyncError::from)
        })
        .await
        .unwrap();

        let count: i64 = db
            .run(|conn| {
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM {t} WHERE table_name='users' AND operation='INSERT'", t = CHANGES_TABLE),
                    [],
                    |row| row.get(0),
                )
                .map_err(crate::error::SyncError::from)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn update_with_no_changed_columns_does_not_log() {
        let (manager, db) = manager_with_table().await;
        manager.setup_change_tracking("users", true).await.unwrap();
        db.run(|conn| {
            conn.execute("INSERT INTO users (name, email) VALUES ('A', 'a@x')", [])?;
            conn.execute("UPDATE users SET name = 'A' WHERE name = 'A'", [])
                .map_err(crate::error::SyncError::from)
        })
        .await
        .unwrap();

        let count: i64 = db
            .run(|conn| {
                conn.query_row(
                    &format!("SELECT COUNT(*) FROM {t} WHERE operation='UPDATE'", t = CHANGES_TABLE),
                    [],
                    |row| row.get(0),
                )
                .map_err(crate::error::SyncError::from)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
