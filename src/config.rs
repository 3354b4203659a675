use std::time::Duration;

use crate::merge::{ConflictStrategy, CustomResolver};

/// Engine-wide tunables, with the documented defaults from the
/// specification's configuration-knobs table.
#[derive(Clone)]
pub struct SyncConfig {
    /// Pruning horizon for uploaded change-log rows. Default 30 days.
    pub change_log_retention_days: i64,
    /// Back-fill pre-existing rows as synthetic INSERT log entries on
    /// first tracking of a table. Default true.
    pub sync_existing_data: bool,
    /// Merge policy. Default last-write-wins.
    pub conflict_strategy: ConflictStrategy,
    /// Required iff `conflict_strategy` is `Custom`.
    pub custom_resolver: Option<CustomResolver>,
    /// Scheduler trailing-edge debounce window. Default 5s.
    pub debounce_interval: Duration,
    /// Worker periodic sweep interval. Default 5 minutes.
    pub periodic_sync_interval: Duration,
    /// Upload batching ceiling. Default 500.
    pub max_batch_size: usize,
    /// Change-log pruning threshold. Default 10,000.
    pub queue_cap: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            change_log_retention_days: 30,
            sync_existing_data: true,
            conflict_strategy: ConflictStrategy::LastWriteWins,
            custom_resolver: None,
            debounce_interval: Duration::from_secs(5),
            periodic_sync_interval: Duration::from_secs(5 * 60),
            max_batch_size: 500,
            queue_cap: 10_000,
        }
    }
}

impl SyncConfig {
    /// Validates the invariant that a custom resolver is present iff the
    /// strategy requires one.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.conflict_strategy, &self.custom_resolver) {
            (ConflictStrategy::Custom, None) => {
                Err("conflict_strategy=custom requires custom_resolver".to_string())
            }
            (strategy, Some(_)) if !matches!(strategy, ConflictStrategy::Custom) => {
                Err("custom_resolver set but conflict_strategy != custom".to_string())
            }
            _ => Ok(()),
        }
    }
}
