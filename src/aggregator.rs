use std::collections::BTreeMap;
use std::sync::Arc;

use crate::change_log::{ChangeData, ChangeLogEntry, ChangeLogStore, Operation};
use crate::error::Result;

/// One collapsed, on-wire-ready change produced by the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatedChange {
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub timestamp: i64,
    pub version: i64,
    pub data: ChangeData,
}

impl From<ChangeLogEntry> for AggregatedChange {
    fn from(e: ChangeLogEntry) -> Self {
        AggregatedChange {
            table_name: e.table_name,
            record_id: e.record_id,
            operation: e.operation(),
            timestamp: e.timestamp,
            version: e.version,
            data: e.data,
        }
    }
}

/// Result of aggregating one table: the optimized changes to transmit,
/// plus every original change-log row id consumed, so the worker can mark
/// them `synced=1` after a successful upload regardless of whether they
/// survived collapsing.
pub struct AggregationResult {
    pub changes: Vec<AggregatedChange>,
    pub affected_ids: Vec<i64>,
}

/// Reads unsynced rows for a table and collapses per-record sequences into
/// the minimal on-wire equivalent, per the collapse rules:
///
/// | sequence | result |
/// |---|---|
/// | single entry | unchanged |
/// | INSERT..DELETE | eliminated |
/// | ..DELETE | only the final DELETE |
/// | INSERT, UPDATE+ | one INSERT, `data.new` from the last entry |
/// | UPDATE, UPDATE+ | one UPDATE, `old` from the first, `new` from the last |
/// | anything else | the last entry |
pub struct ChangeAggregator {
    change_log: Arc<ChangeLogStore>,
}

impl ChangeAggregator {
    pub fn new(change_log: Arc<ChangeLogStore>) -> Self {
        Self { change_log }
    }

    pub async fn aggregate(&self, table: &str) -> Result<AggregationResult> {
        let rows = self.change_log.pending_for_table(table.to_string()).await?;
        Ok(Self::aggregate_entries(rows))
    }

    /// Pure collapsing logic, split out from the DB read for direct
    /// testing against the specification's literal scenarios.
    pub fn aggregate_entries(rows: Vec<ChangeLogEntry>) -> AggregationResult {
        // Preserve (record_id, timestamp ASC) grouping: BTreeMap keeps
        // record_id groups ordered, and within a group we rely on the
        // store's query ordering (timestamp ASC) being preserved by push.
        let mut by_record: BTreeMap<String, Vec<ChangeLogEntry>> = BTreeMap::new();
        for row in rows {
            by_record.entry(row.record_id.clone()).or_default().push(row);
        }

        let mut changes = Vec::new();
        let mut affected_ids = Vec::new();

        for (_, mut seq) in by_record {
            seq.sort_by_key(|e| e.timestamp);
            for e in &seq {
                affected_ids.push(e.id);
            }

            if seq.len() == 1 {
                changes.push(AggregatedChange::from(seq.into_iter().next().unwrap()));
                continue;
            }

            let first = seq.first().unwrap();
            let last = seq.last().unwrap();
            let starts_with_insert = matches!(first.data, ChangeData::Insert { .. });
            let ends_with_delete = matches!(last.data, ChangeData::Delete { .. });
            let all_updates = seq.iter().all(|e| matches!(e.data, ChangeData::Update { .. }));

            if starts_with_insert && ends_with_delete {
                // INSERT then ... then DELETE: eliminated entirely.
                continue;
            }
            if ends_with_delete {
                // ... ending in DELETE: only the final DELETE is transmitted.
                changes.push(AggregatedChange::from(seq.into_iter().last().unwrap()));
                continue;
            }
            if starts_with_insert {
                // INSERT then UPDATE+: a single INSERT carrying the final `new`.
                let new_value = last.data.new_value().cloned().unwrap_or(serde_json::Value::Null);
                changes.push(AggregatedChange {
                    table_name: last.table_name.clone(),
                    record_id: last.record_id.clone(),
                    operation: Operation::Insert,
                    timestamp: last.timestamp,
                    version: last.version,
                    data: ChangeData::Insert { new: new_value },
                });
                continue;
            }
            if all_updates {
                // UPDATE then UPDATE+: old from first, new from last.
                let old_value = first.data.old_value().cloned().unwrap_or(serde_json::Value::Null);
                let new_value = last.data.new_value().cloned().unwrap_or(serde_json::Value::Null);
                changes.push(AggregatedChange {
                    table_name: last.table_name.clone(),
                    record_id: last.record_id.clone(),
                    operation: Operation::Update,
                    timestamp: last.timestamp,
                    version: last.version,
                    data: ChangeData::Update { old: old_value, new: new_value },
                });
                continue;
            }

            // Any other case: the last entry.
            changes.push(AggregatedChange::from(seq.into_iter().last().unwrap()));
        }

        AggregationResult { changes, affected_ids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, record_id: &str, ts: i64, version: i64, data: ChangeData) -> ChangeLogEntry {
        ChangeLogEntry {
            id,
            table_name: "users".into(),
            record_id: record_id.into(),
            timestamp: ts,
            version,
            data,
            synced: crate::change_log::SyncStatus::Pending,
        }
    }

    #[test]
    fn s1_single_insert_passes_through() {
        let rows = vec![entry(1, "g1", 100, 1, ChangeData::Insert { new: serde_json::json!({"name":"A"}) })];
        let result = ChangeAggregator::aggregate_entries(rows);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.affected_ids, vec![1]);
        assert_eq!(result.changes[0].operation, Operation::Insert);
    }

    #[test]
    fn s2_insert_then_update_collapses_to_one_insert() {
        let rows = vec![
            entry(1, "g1", 100, 1, ChangeData::Insert { new: serde_json::json!({"name":"A"}) }),
            entry(
                2,
                "g1",
                200,
                2,
                ChangeData::Update {
                    old: serde_json::json!({"name":"A"}),
                    new: serde_json::json!({"name":"A","email":"a@x"}),
                },
            ),
        ];
        let result = ChangeAggregator::aggregate_entries(rows);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.affected_ids, vec![1, 2]);
        let change = &result.changes[0];
        assert_eq!(change.operation, Operation::Insert);
        assert_eq!(change.version, 2);
        assert_eq!(change.data.new_value().unwrap()["email"], "a@x");
    }

    #[test]
    fn s3_insert_then_delete_is_eliminated() {
        let rows = vec![
            entry(1, "g1", 100, 1, ChangeData::Insert { new: serde_json::json!({"name":"A"}) }),
            entry(2, "g1", 200, 2, ChangeData::Delete { old: serde_json::json!({"name":"A"}) }),
        ];
        let result = ChangeAggregator::aggregate_entries(rows);
        assert!(result.changes.is_empty());
        assert_eq!(result.affected_ids, vec![1, 2]);
    }

    #[test]
    fn update_then_update_keeps_first_old_and_last_new() {
        let rows = vec![
            entry(
                1,
                "g1",
                100,
                2,
                ChangeData::Update { old: serde_json::json!({"a":1}), new: serde_json::json!({"a":2}) },
            ),
            entry(
                2,
                "g1",
                200,
                3,
                ChangeData::Update { old: serde_json::json!({"a":2}), new: serde_json::json!({"a":3}) },
            ),
        ];
        let result = ChangeAggregator::aggregate_entries(rows);
        assert_eq!(result.changes.len(), 1);
        let change = &result.changes[0];
        assert_eq!(change.data.old_value().unwrap()["a"], 1);
        assert_eq!(change.data.new_value().unwrap()["a"], 3);
    }

    #[test]
    fn sequence_ending_in_delete_keeps_only_delete() {
        let rows = vec![
            entry(
                1,
                "g1",
                100,
                2,
                ChangeData::Update { old: serde_json::json!({"a":1}), new: serde_json::json!({"a":2}) },
            ),
            entry(2, "g1", 200, 3, ChangeData::Delete { old: serde_json::json!({"a":2}) }),
        ];
        let result = ChangeAggregator::aggregate_entries(rows);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].operation, Operation::Delete);
    }

    #[test]
    fn multiple_records_are_independent() {
        let rows = vec![
            entry(1, "g1", 100, 1, ChangeData::Insert { new: serde_json::json!({}) }),
            entry(2, "g2", 100, 1, ChangeData::Insert { new: serde_json::json!({}) }),
        ];
        let result = ChangeAggregator::aggregate_entries(rows);
        assert_eq!(result.changes.len(), 2);
    }
}
