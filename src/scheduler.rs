use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::change_log::Operation;
use crate::queue::SyncQueue;

pub type SyncFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type SyncCallback = Arc<dyn Fn() -> SyncFuture + Send + Sync>;

struct Timers {
    upload: Option<JoinHandle<()>>,
    download: Option<JoinHandle<()>>,
}

impl Default for Timers {
    fn default() -> Self {
        Self { upload: None, download: None }
    }
}

/// Debounces local writes and remote-change notices into a single sync
/// call per settle window, and guarantees only one upload and one
/// download run at a time. Downloads yield to an upload that is pending
/// or in flight, since an upload may change what needs downloading.
pub struct SyncScheduler {
    queue: Arc<SyncQueue>,
    debounce_interval: Duration,
    on_sync: SyncCallback,
    timers: Mutex<Timers>,
    upload_in_progress: Arc<std::sync::atomic::AtomicBool>,
    download_in_progress: Arc<std::sync::atomic::AtomicBool>,
}

impl SyncScheduler {
    pub fn new(queue: Arc<SyncQueue>, debounce_interval: Duration, on_sync: SyncCallback) -> Self {
        Self {
            queue,
            debounce_interval,
            on_sync,
            timers: Mutex::new(Timers::default()),
            upload_in_progress: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            download_in_progress: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub async fn schedule_upload(&self, table: &str, op: Operation) {
        self.queue.add_local(table, op).await;
        self.arm_upload().await;
    }

    pub async fn schedule_download(&self) {
        self.queue.add_download_notice().await;
        self.arm_download().await;
    }

    /// Bypasses debounce and runs a sync cycle immediately, canceling any
    /// pending timers so a double-fire can't happen right after.
    pub async fn force_sync_now(&self) {
        let mut timers = self.timers.lock().await;
        if let Some(h) = timers.upload.take() {
            h.abort();
        }
        if let Some(h) = timers.download.take() {
            h.abort();
        }
        drop(timers);
        self.fire().await;
    }

    async fn arm_upload(&self) {
        let mut timers = self.timers.lock().await;
        if let Some(h) = timers.upload.take() {
            h.abort();
        }
        // An upload supersedes any pending download timer: the upload's
        // own cycle will run the download afterward.
        if let Some(h) = timers.download.take() {
            h.abort();
        }
        let callback = self.clone_for_timer();
        let interval = self.debounce_interval;
        timers.upload = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            callback.fire().await;
        }));
    }

    async fn arm_download(&self) {
        let mut timers = self.timers.lock().await;
        if self.upload_in_progress.load(std::sync::atomic::Ordering::SeqCst) {
            // An upload is in flight; its own cycle downloads too, so this
            // notice is redundant. `upload_in_progress` drops back to
            // false once that cycle's `fire()` returns, so a later
            // schedule_download arms its own timer again rather than
            // being suppressed forever.
            return;
        }
        if let Some(h) = timers.download.take() {
            h.abort();
        }
        let callback = self.clone_for_timer();
        let interval = self.debounce_interval;
        timers.download = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            callback.fire().await;
        }));
    }

    fn clone_for_timer(&self) -> SchedulerHandle {
        SchedulerHandle {
            queue: self.queue.clone(),
            on_sync: self.on_sync.clone(),
            upload_in_progress: self.upload_in_progress.clone(),
            download_in_progress: self.download_in_progress.clone(),
        }
    }

    async fn fire(&self) {
        self.clone_for_timer().fire().await;
    }
}

/// Detached handle used from spawned timer tasks; holds only what `fire`
/// needs so the timer doesn't have to borrow the scheduler across `.await`.
struct SchedulerHandle {
    queue: Arc<SyncQueue>,
    on_sync: SyncCallback,
    upload_in_progress: Arc<std::sync::atomic::AtomicBool>,
    download_in_progress: Arc<std::sync::atomic::AtomicBool>,
}

impl SchedulerHandle {
    async fn fire(&self) {
        use std::sync::atomic::Ordering;

        if self.queue.is_empty().await {
            return;
        }
        if self.upload_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        self.download_in_progress.store(true, Ordering::SeqCst);

        (self.on_sync)().await;

        self.upload_in_progress.store(false, Ordering::SeqCst);
        self.download_in_progress.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn s6_five_calls_within_the_debounce_window_fire_once() {
        let queue = Arc::new(SyncQueue::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        let on_sync: SyncCallback = Arc::new(move || -> SyncFuture {
            let calls = calls_for_cb.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = SyncScheduler::new(queue, Duration::from_millis(30), on_sync);

        for _ in 0..5 {
            scheduler.schedule_upload("users", Operation::Insert).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_sync_now_runs_immediately() {
        let queue = Arc::new(SyncQueue::new());
        queue.add_local("users", Operation::Insert).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        let on_sync: SyncCallback = Arc::new(move || -> SyncFuture {
            let calls = calls_for_cb.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = SyncScheduler::new(queue, Duration::from_secs(30), on_sync);
        scheduler.force_sync_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn download_is_schedulable_again_once_upload_completes() {
        let queue = Arc::new(SyncQueue::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        let on_sync: SyncCallback = Arc::new(move || -> SyncFuture {
            let calls = calls_for_cb.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = SyncScheduler::new(queue, Duration::from_millis(10), on_sync);

        // First upload cycle runs to completion.
        scheduler.schedule_upload("users", Operation::Insert).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A download notice afterward must still arm its own timer rather
        // than being suppressed forever by a stale in-flight check.
        scheduler.schedule_download().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_queue_does_not_invoke_callback() {
        let queue = Arc::new(SyncQueue::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        let on_sync: SyncCallback = Arc::new(move || -> SyncFuture {
            let calls = calls_for_cb.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = SyncScheduler::new(queue, Duration::from_millis(10), on_sync);
        scheduler.force_sync_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
