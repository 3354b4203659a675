use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;

use crate::change_log::Operation;
use crate::network::RemoteChange;

#[derive(Default)]
struct QueueState {
    pending_uploads: HashMap<String, HashSet<Operation>>,
    pending_download: bool,
    remote_changes: Vec<RemoteChange>,
}

/// Process-local, in-memory pending-work registry. Not durable — durability
/// lives entirely in the change log; losing this state only means the
/// engine re-derives "what to drain" from the database on next schedule.
#[derive(Default)]
pub struct SyncQueue {
    state: Mutex<QueueState>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_local(&self, table: &str, op: Operation) {
        let mut state = self.state.lock().await;
        state.pending_uploads.entry(table.to_string()).or_default().insert(op);
    }

    pub async fn add_download_notice(&self) {
        self.state.lock().await.pending_download = true;
    }

    pub async fn add_remote_changes(&self, changes: Vec<RemoteChange>) {
        self.state.lock().await.remote_changes.extend(changes);
    }

    pub async fn get_remote_changes(&self) -> Vec<RemoteChange> {
        self.state.lock().await.remote_changes.clone()
    }

    pub async fn clear_remote_changes(&self) {
        self.state.lock().await.remote_changes.clear();
    }

    pub async fn mark_table_uploaded(&self, table: &str) {
        self.state.lock().await.pending_uploads.remove(table);
    }

    pub async fn mark_download_processed(&self) {
        self.state.lock().await.pending_download = false;
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.pending_uploads.is_empty() && !state.pending_download && state.remote_changes.is_empty()
    }

    pub async fn pending_upload_tables(&self) -> Vec<String> {
        self.state.lock().await.pending_uploads.keys().cloned().collect()
    }

    pub async fn has_pending_uploads(&self) -> bool {
        !self.state.lock().await.pending_uploads.is_empty()
    }

    pub async fn has_pending_download(&self) -> bool {
        self.state.lock().await.pending_download
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_empty() {
        let queue = SyncQueue::new();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn add_local_marks_not_empty_and_tracks_table() {
        let queue = SyncQueue::new();
        queue.add_local("users", Operation::Insert).await;
        assert!(!queue.is_empty().await);
        assert_eq!(queue.pending_upload_tables().await, vec!["users".to_string()]);
        queue.mark_table_uploaded("users").await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn download_notice_tracked_independently() {
        let queue = SyncQueue::new();
        queue.add_download_notice().await;
        assert!(queue.has_pending_download().await);
        queue.mark_download_processed().await;
        assert!(!queue.has_pending_download().await);
    }
}
