// Background Work Queue - bounded pool for retention sweeps and event delivery

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::{BackupEvent, BackupRequest};

/// Work the backup manager hands off instead of doing inline
#[derive(Debug, Clone)]
pub enum Job {
    /// Create a backup requested with `background(true)`
    Backup { request: BackupRequest, source: PathBuf },
    /// Apply the retention policy to one source file's backups
    RetentionSweep(PathBuf),
    /// Deliver an event to registered handlers
    Notify(BackupEvent),
}

impl Job {
    fn label(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::RetentionSweep(_) => "retention_sweep",
            Self::Notify(_) => "notify",
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: AtomicUsize,
    completed: AtomicUsize,
    dropped: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn finish_one(&self) {
        // saturating: shutdown may already have reset the counter
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if matches!(previous, Ok(1) | Err(_)) {
            self.idle.notify_waiters();
        }
    }
}

/// Bounded channel drained by a fixed number of worker tasks
///
/// Submissions never block: when the channel is full the job is dropped and
/// counted, which keeps sweeps and notifications best-effort.
pub struct TaskQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<QueueState>,
}

impl TaskQueue {
    /// Spawn `workers` tasks running `handler` for each job; must be called inside a runtime
    pub fn start<F, Fut>(workers: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handler = Arc::new(handler);
        let state = Arc::new(QueueState::default());

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let label = job.label();
                        handler(job).await;
                        state.completed.fetch_add(1, Ordering::SeqCst);
                        state.finish_one();
                        debug!(worker_id, job = label, "Background job finished");
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            state,
        }
    }

    /// Queue a job; returns `false` if it was dropped
    pub fn submit(&self, job: Job) -> bool {
        let Some(sender) = self.sender.lock().clone() else {
            return false;
        };
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(job = job.label(), "Background queue full, dropping job");
                self.state.dropped.fetch_add(1, Ordering::SeqCst);
                self.state.finish_one();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.state.finish_one();
                false
            }
        }
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has finished
    pub async fn idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, let the workers drain what is queued, then wait for them
    pub async fn close(&self) {
        self.sender.lock().take();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop accepting jobs and abort the workers, discarding queued work
    pub fn shutdown(&self) {
        self.sender.lock().take();
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
        self.state.pending.store(0, Ordering::SeqCst);
        self.state.idle.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        for handle in self.workers.get_mut().drain(..) {
            handle.abort();
        }
    }
}
