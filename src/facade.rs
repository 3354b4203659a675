use std::collections::HashSet;
use std::sync::Arc;

use rand::RngCore;
use regex::Regex;
use rusqlite::params_from_iter;
use std::sync::OnceLock;

use crate::db_executor::DbExecutor;
use crate::error::{Result, SyncError};
use crate::notifier::{ChangeKind, ChangeNotifier};

/// Generates a fresh 128-bit random-hex global id, the same shape the
/// sync-owned triggers generate in SQL via `randomblob(16)`.
pub fn generate_global_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The kind of statement a raw SQL string represents, for affected-table
/// bookkeeping and notification fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    ReadOnly,
}

impl StatementKind {
    pub fn is_mutating(self) -> bool {
        !matches!(self, StatementKind::ReadOnly)
    }

    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            StatementKind::Insert => Some(ChangeKind::Insert),
            StatementKind::Update => Some(ChangeKind::Update),
            StatementKind::Delete => Some(ChangeKind::Delete),
            StatementKind::ReadOnly => None,
        }
    }
}

fn leading_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(INSERT|UPDATE|DELETE|SELECT|WITH)\b").unwrap())
}

fn cte_names_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([A-Za-z_][A-Za-z0-9_]*)\s+AS\s*\(").unwrap())
}

fn table_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:FROM|JOIN|UPDATE|DELETE\s+FROM|INTO|TABLE)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
    })
}

fn insert_shape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)^\s*INSERT\s+INTO\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*VALUES\s*\(([^)]*)\)\s*;?\s*$",
        )
        .unwrap()
    })
}

/// Classifies a raw SQL statement as INSERT/UPDATE/DELETE/read-only.
/// Case-insensitive; a leading `WITH ... AS (...)` CTE prefix doesn't
/// change the classification of the statement that follows it.
pub fn classify_statement(sql: &str) -> StatementKind {
    let mut search_from = sql;
    if let Some(caps) = leading_keyword_re().captures(search_from) {
        if caps[1].eq_ignore_ascii_case("WITH") {
            // Skip past the CTE definitions to the statement's real verb.
            if let Some(last_paren_group_end) = find_cte_body_end(search_from) {
                search_from = &search_from[last_paren_group_end..];
            }
        }
    }
    match leading_keyword_re().captures(search_from) {
        Some(caps) if caps[1].eq_ignore_ascii_case("INSERT") => StatementKind::Insert,
        Some(caps) if caps[1].eq_ignore_ascii_case("UPDATE") => StatementKind::Update,
        Some(caps) if caps[1].eq_ignore_ascii_case("DELETE") => StatementKind::Delete,
        _ => StatementKind::ReadOnly,
    }
}

/// Very small balanced-paren scanner used to step past a `WITH name AS
/// (...)[, name2 AS (...)]` prefix to find the statement's leading verb.
fn find_cte_body_end(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut idx = 0;
    let mut last_end = None;
    loop {
        let rest = &sql[idx..];
        let m = Regex::new(r"(?i)AS\s*\(").ok()?.find(rest)?;
        let open_idx = idx + m.end() - 1;
        let mut depth = 0i32;
        let mut i = open_idx;
        while i < bytes.len() {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if depth != 0 {
            return last_end;
        }
        last_end = Some(i + 1);
        idx = i + 1;
        // Stop once the next non-comma token isn't another CTE definition.
        let after = sql[idx..].trim_start();
        if !after.starts_with(',') {
            break;
        }
        idx += sql[idx..].len() - after.len() + 1;
    }
    last_end
}

/// Extracts affected table names referenced via `FROM|JOIN|UPDATE|DELETE
/// FROM|INTO|TABLE <ident>`, excluding names introduced as CTE aliases by
/// a leading `WITH name AS (...)`. Case-insensitive.
pub fn extract_tables(sql: &str) -> Vec<String> {
    let cte_names: HashSet<String> = cte_names_re()
        .captures_iter(sql)
        .map(|c| c[1].to_ascii_lowercase())
        .collect();

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in table_ref_re().captures_iter(sql) {
        let name = caps[1].to_string();
        let lower = name.to_ascii_lowercase();
        if cte_names.contains(&lower) {
            continue;
        }
        if seen.insert(lower) {
            out.push(name);
        }
    }
    out
}

/// Rewrites a single-row `INSERT INTO t (cols) VALUES (vals)` statement to
/// append a `global_id` column and a fresh value, returning the rewritten
/// SQL and the generated id. Anything structurally more complex than a
/// single-row literal insert is rejected: per the specification's design
/// notes, the safer contract is to require structured inserts for
/// anything the splice can't express confidently.
pub fn inject_global_id_into_raw_insert(sql: &str) -> Result<(String, String)> {
    let caps = insert_shape_re()
        .captures(sql)
        .ok_or_else(|| SyncError::SyncState("raw INSERT shape not recognized for global_id injection".into()))?;
    let table = &caps[1];
    let cols = caps[2].trim();
    let vals = caps[3].trim();

    if cols.split(',').any(|c| c.trim().eq_ignore_ascii_case("global_id")) {
        return Ok((sql.to_string(), String::new()));
    }

    let global_id = generate_global_id();
    let rewritten = format!(
        "INSERT INTO {table} ({cols}, global_id) VALUES ({vals}, '{global_id}')",
    );
    Ok((rewritten, global_id))
}

/// A thin pass-through around the relational API. Guarantees every insert
/// carries a `global_id` and captures the set of tables touched by a
/// transaction so exactly one notification per table fires on commit.
/// Does not read or mutate the change log directly — durable tracking is
/// entirely the triggers' job.
pub struct DatabaseFacade {
    db: Arc<DbExecutor>,
    notifier: Arc<ChangeNotifier>,
}

impl DatabaseFacade {
    pub fn new(db: Arc<DbExecutor>, notifier: Arc<ChangeNotifier>) -> Self {
        Self { db, notifier }
    }

    /// Structured insert: injects `global_id` into `values` if absent,
    /// then builds and executes a parameterized `INSERT`. Returns the
    /// `global_id` used.
    pub async fn insert(&self, table: &str, mut values: Vec<(String, serde_json::Value)>) -> Result<String> {
        let global_id = match values.iter().find(|(k, _)| k == "global_id") {
            Some((_, v)) if v.is_string() => v.as_str().unwrap().to_string(),
            _ => {
                let id = generate_global_id();
                values.retain(|(k, _)| k != "global_id");
                values.push(("global_id".to_string(), serde_json::Value::String(id.clone())));
                id
            }
        };

        let table = table.to_string();
        self.db
            .run(move |conn| {
                let cols = values.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>().join(", ");
                let placeholders = (1..=values.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
                let sql = format!("INSERT INTO {table} ({cols}) VALUES ({placeholders})");
                let params = values
                    .iter()
                    .map(|(_, v)| json_value_to_sql(v))
                    .collect::<Vec<_>>();
                conn.execute(&sql, params_from_iter(params)).map_err(SyncError::from)?;
                Ok(())
            })
            .await?;

        self.notifier.notify(&table, ChangeKind::Insert).await;
        Ok(global_id)
    }

    /// Executes a raw SQL statement, injecting `global_id` for a raw
    /// single-row `INSERT` if the statement doesn't already include one.
    /// Notifies every table the statement touches on success.
    pub async fn execute_raw(&self, sql: &str) -> Result<usize> {
        let kind = classify_statement(sql);
        let rewritten = if kind == StatementKind::Insert {
            inject_global_id_into_raw_insert(sql)?.0
        } else {
            sql.to_string()
        };

        let affected = self
            .db
            .run(move |conn| conn.execute(&rewritten, []).map_err(SyncError::from))
            .await?;

        if let Some(change_kind) = kind.change_kind() {
            for table in extract_tables(sql) {
                self.notifier.notify(&table, change_kind).await;
            }
        }
        Ok(affected)
    }

    /// Runs `f` inside a transaction, collecting the set of tables touched
    /// by any mutating statement `f` classifies via `record(sql)`. Fires
    /// exactly one notification per affected table after a successful
    /// commit; a rolled-back transaction notifies nothing.
    pub async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &mut TransactionScope) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (result, affected) = self
            .db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mut scope = TransactionScope::default();
                let r = f(&tx, &mut scope)?;
                tx.commit()?;
                Ok((r, scope.affected))
            })
            .await?;

        for (table, kind) in affected {
            self.notifier.notify(&table, kind).await;
        }
        Ok(result)
    }
}

/// Accumulates tables touched during a `DatabaseFacade::transaction` call.
#[derive(Default)]
pub struct TransactionScope {
    affected: Vec<(String, ChangeKind)>,
}

impl TransactionScope {
    /// Records that `sql` is about to run, classifying it and noting every
    /// affected table for the post-commit fan-out.
    pub fn record(&mut self, sql: &str) {
        let kind = classify_statement(sql);
        if let Some(change_kind) = kind.change_kind() {
            for table in extract_tables(sql) {
                self.affected.push((table, change_kind));
            }
        }
    }
}

pub(crate) fn json_value_to_sql(v: &serde_json::Value) -> rusqlite::types::Value {
    match v {
        serde_json::Value::Null => rusqlite::types::Value::Null,
        serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_basic_statements() {
        assert_eq!(classify_statement("insert into users (a) values (1)"), StatementKind::Insert);
        assert_eq!(classify_statement("UPDATE users SET a=1"), StatementKind::Update);
        assert_eq!(classify_statement("DELETE FROM users WHERE a=1"), StatementKind::Delete);
        assert_eq!(classify_statement("SELECT * FROM users"), StatementKind::ReadOnly);
    }

    #[test]
    fn classifies_statement_after_cte() {
        let sql = "WITH recent AS (SELECT * FROM users WHERE a=1) INSERT INTO orders (a) VALUES (1)";
        assert_eq!(classify_statement(sql), StatementKind::Insert);
    }

    #[test]
    fn extracts_tables_ignoring_cte_alias() {
        let sql = "WITH recent AS (SELECT * FROM users) SELECT * FROM recent JOIN orders ON 1=1";
        let tables = extract_tables(sql);
        assert!(tables.iter().any(|t| t.eq_ignore_ascii_case("users")));
        assert!(tables.iter().any(|t| t.eq_ignore_ascii_case("orders")));
        assert!(!tables.iter().any(|t| t.eq_ignore_ascii_case("recent")));
    }

    #[test]
    fn injects_global_id_into_raw_insert() {
        let (sql, id) = inject_global_id_into_raw_insert("INSERT INTO users (name, email) VALUES ('A', 'a@x')").unwrap();
        assert!(sql.contains("global_id"));
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn does_not_double_inject_when_present() {
        let (sql, id) =
            inject_global_id_into_raw_insert("INSERT INTO users (name, global_id) VALUES ('A', 'g1')").unwrap();
        assert_eq!(sql, "INSERT INTO users (name, global_id) VALUES ('A', 'g1')");
        assert!(id.is_empty());
    }
}
