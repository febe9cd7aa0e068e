//! Process-wide render queue.
//!
//! [`RenderQueue`] is a clonable handle over a single mutex-protected list of
//! jobs. The UI side enqueues and removes; the drain loop snapshots, updates
//! state and removes finished jobs. The lock is only held for the duration of
//! one operation and never across an `.await`.

use crate::job::{JobId, JobState, RenderJob, RenderRequest};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The source video does not exist on disk
    #[error("source video does not exist: {}", .0.display())]
    SourceMissing(PathBuf),
}

/// Result of a successful enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job was added.
    Added(RenderJob),
    /// An identical job is already queued; nothing changed.
    Duplicate(JobId),
}

struct Inner {
    jobs: Mutex<Vec<RenderJob>>,
    revision: watch::Sender<u64>,
}

/// Shared, synchronized render queue.
#[derive(Clone)]
pub struct RenderQueue {
    inner: Arc<Inner>,
}

impl Default for RenderQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderQueue {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(Vec::new()),
                revision,
            }),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<RenderJob>> {
        // A panic while holding the lock cannot leave the Vec half-mutated.
        self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    /// Add a job to the back of the queue.
    ///
    /// Fails when the source video does not exist. A job with the same
    /// source path and time range as a queued job is a logged no-op.
    pub fn enqueue(&self, request: RenderRequest) -> Result<Enqueued, QueueError> {
        if !request.source_video_path.is_file() {
            return Err(QueueError::SourceMissing(request.source_video_path));
        }

        let job = {
            let mut jobs = self.jobs();
            if let Some(existing) = jobs.iter().find(|job| {
                job.same_identity(
                    &request.source_video_path,
                    request.start_time,
                    request.end_time,
                )
            }) {
                debug!(
                    job_id = %existing.id,
                    source = %request.source_video_path.display(),
                    "duplicate render request ignored"
                );
                return Ok(Enqueued::Duplicate(existing.id));
            }

            let job = RenderJob::from_request(request);
            jobs.push(job.clone());
            job
        };

        info!(
            job_id = %job.id,
            source = %job.source_video_path.display(),
            output = %job.output_name,
            "job enqueued"
        );
        self.notify();
        Ok(Enqueued::Added(job))
    }

    /// Remove a job by id, returning it if it was queued.
    pub fn dequeue(&self, id: JobId) -> Option<RenderJob> {
        let removed = {
            let mut jobs = self.jobs();
            let index = jobs.iter().position(|job| job.id == id)?;
            jobs.remove(index)
        };
        debug!(job_id = %id, state = %removed.state, "job removed from queue");
        self.notify();
        Some(removed)
    }

    /// Snapshot of all jobs in insertion order.
    pub fn list(&self) -> Vec<RenderJob> {
        self.jobs().clone()
    }

    pub fn get(&self, id: JobId) -> Option<RenderJob> {
        self.jobs().iter().find(|job| job.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// Receiver that changes whenever the queue is mutated.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Move a job to a new state. Reserved for the drain loop.
    pub(crate) fn set_state(&self, id: JobId, state: JobState, message: impl Into<String>) {
        let updated = {
            let mut jobs = self.jobs();
            match jobs.iter_mut().find(|job| job.id == id) {
                Some(job) => {
                    job.state = state;
                    job.status_message = message.into();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify();
        }
    }

    /// Replace the status message of a job without touching its state.
    pub(crate) fn set_status_message(&self, id: JobId, message: impl Into<String>) {
        let updated = {
            let mut jobs = self.jobs();
            match jobs.iter_mut().find(|job| job.id == id) {
                Some(job) => {
                    job.status_message = message.into();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify();
        }
    }
}

impl std::fmt::Debug for RenderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderQueue")
            .field("len", &self.len())
            .finish()
    }
}
