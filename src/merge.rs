use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregator::AggregatedChange;
use crate::change_log::Operation;
use crate::network::RemoteChange;

/// Configured merge policy.
#[derive(Clone)]
pub enum ConflictStrategy {
    LastWriteWins,
    ServerWins,
    ClientWins,
    Custom,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::Custom => "custom",
        }
    }
}

pub type CustomResolver = Arc<dyn Fn(&MergeCandidate, &MergeCandidate) -> MergeCandidate + Send + Sync>;

/// Which side of the merge a candidate change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A unified view over a local (aggregated) or remote (downloaded) change,
/// the shape the merge engine groups and resolves over.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub origin: Origin,
    pub table_name: String,
    pub record_id: String,
    pub operation: Operation,
    pub timestamp: i64,
    pub version: i64,
    pub data: serde_json::Value,
    pub remote_id: Option<String>,
}

impl From<&AggregatedChange> for MergeCandidate {
    fn from(c: &AggregatedChange) -> Self {
        MergeCandidate {
            origin: Origin::Local,
            table_name: c.table_name.clone(),
            record_id: c.record_id.clone(),
            operation: c.operation,
            timestamp: c.timestamp,
            version: c.version,
            data: serde_json::to_value(&c.data).unwrap_or(serde_json::Value::Null),
            remote_id: None,
        }
    }
}

impl From<&RemoteChange> for MergeCandidate {
    fn from(c: &RemoteChange) -> Self {
        MergeCandidate {
            origin: Origin::Remote,
            table_name: c.change.table_name.clone(),
            record_id: c.change.record_id.clone(),
            operation: c.change.operation,
            timestamp: c.change.timestamp,
            version: c.change.version,
            data: c.change.data.clone(),
            remote_id: Some(c.remote_id.clone()),
        }
    }
}

/// One detected conflict: a record with both a local and a remote
/// candidate in the same merge pass. The worker forwards this to the
/// network client's conflict-report telemetry call.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub strategy: ConflictStrategy,
    pub local: MergeCandidate,
    pub remote: MergeCandidate,
    pub winner: MergeCandidate,
    pub sync_session_id: String,
}

pub struct MergeOutcome {
    pub changes: Vec<MergeCandidate>,
    pub conflicts: Vec<Conflict>,
}

/// Groups concurrent local+remote edits per `(table, record_id)` and
/// resolves each group per the configured strategy. A record with only
/// one candidate passes through untouched; a record with candidates from
/// both sides is a conflict, resolved and reported.
pub struct MergeEngine {
    strategy: ConflictStrategy,
    custom_resolver: Option<CustomResolver>,
}

impl MergeEngine {
    pub fn new(strategy: ConflictStrategy, custom_resolver: Option<CustomResolver>) -> Self {
        Self { strategy, custom_resolver }
    }

    pub fn merge(
        &self,
        local_changes: &[AggregatedChange],
        remote_changes: &[RemoteChange],
        sync_session_id: &str,
    ) -> MergeOutcome {
        let mut by_key: HashMap<(String, String), Vec<MergeCandidate>> = HashMap::new();
        for c in local_changes {
            by_key.entry((c.table_name.clone(), c.record_id.clone())).or_default().push(c.into());
        }
        for c in remote_changes {
            by_key
                .entry((c.change.table_name.clone(), c.change.record_id.clone()))
                .or_default()
                .push(c.into());
        }

        let mut changes = Vec::new();
        let mut conflicts = Vec::new();

        for (_, candidates) in by_key {
            if candidates.len() == 1 {
                changes.push(candidates.into_iter().next().unwrap());
                continue;
            }

            let local = candidates.iter().find(|c| c.origin == Origin::Local).cloned();
            let remote = candidates.iter().find(|c| c.origin == Origin::Remote).cloned();

            let (local, remote) = match (local, remote) {
                (Some(l), Some(r)) => (l, r),
                // No genuine local/remote pair (e.g. two remote entries for
                // the same key within one batch): pass the last through.
                _ => {
                    changes.push(candidates.into_iter().last().unwrap());
                    continue;
                }
            };

            let winner = match &self.strategy {
                ConflictStrategy::LastWriteWins => {
                    candidates.iter().max_by_key(|c| c.timestamp).cloned().unwrap_or_else(|| local.clone())
                }
                ConflictStrategy::ServerWins => remote.clone(),
                ConflictStrategy::ClientWins => local.clone(),
                ConflictStrategy::Custom => {
                    let resolver = self.custom_resolver.as_ref().expect("custom strategy requires a resolver");
                    resolver(&local, &remote)
                }
            };

            conflicts.push(Conflict {
                strategy: self.strategy.clone(),
                local: local.clone(),
                remote: remote.clone(),
                winner: winner.clone(),
                sync_session_id: sync_session_id.to_string(),
            });
            changes.push(winner);
        }

        MergeOutcome { changes, conflicts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_log::ChangeData;

    fn local(ts: i64) -> AggregatedChange {
        AggregatedChange {
            table_name: "users".into(),
            record_id: "g1".into(),
            operation: Operation::Update,
            timestamp: ts,
            version: 2,
            data: ChangeData::Update { old: serde_json::json!({"name":"old"}), new: serde_json::json!({"name":"local"}) },
        }
    }

    fn remote(ts: i64) -> RemoteChange {
        RemoteChange {
            remote_id: "r1".into(),
            change: crate::network::WireChange {
                change_id: None,
                table_name: "users".into(),
                record_id: "g1".into(),
                operation: Operation::Update,
                timestamp: ts,
                version: 2,
                data: serde_json::json!({"old":{"name":"old"},"new":{"name":"remote"}}),
            },
        }
    }

    #[test]
    fn s5_last_write_wins_picks_remote_when_later() {
        let engine = MergeEngine::new(ConflictStrategy::LastWriteWins, None);
        let outcome = engine.merge(&[local(100)], &[remote(200)], "session-1");
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].origin, Origin::Remote);
        assert_eq!(outcome.changes[0].data["new"]["name"], "remote");
        assert_eq!(outcome.conflicts[0].strategy.as_str(), "last_write_wins");
    }

    #[test]
    fn server_wins_ignores_timestamps() {
        let engine = MergeEngine::new(ConflictStrategy::ServerWins, None);
        let outcome = engine.merge(&[local(500)], &[remote(100)], "session-1");
        assert_eq!(outcome.changes[0].origin, Origin::Remote);
    }

    #[test]
    fn client_wins_ignores_timestamps() {
        let engine = MergeEngine::new(ConflictStrategy::ClientWins, None);
        let outcome = engine.merge(&[local(100)], &[remote(500)], "session-1");
        assert_eq!(outcome.changes[0].origin, Origin::Local);
    }

    #[test]
    fn single_sided_change_passes_through_without_conflict() {
        let engine = MergeEngine::new(ConflictStrategy::LastWriteWins, None);
        let outcome = engine.merge(&[local(100)], &[], "session-1");
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.changes.len(), 1);
    }

    #[test]
    fn custom_resolver_is_used() {
        let resolver: CustomResolver = Arc::new(|local, _remote| local.clone());
        let engine = MergeEngine::new(ConflictStrategy::Custom, Some(resolver));
        let outcome = engine.merge(&[local(100)], &[remote(900)], "session-1");
        assert_eq!(outcome.changes[0].origin, Origin::Local);
    }
}
