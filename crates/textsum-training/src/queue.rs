//! In-process training queue.
//!
//! Jobs are executed one at a time by a single worker task, so two training requests never
//! write to the same artifact directories concurrently. Cancelling a queued job removes it from
//! the schedule; cancelling a running job raises its cancel flag, which the runner is expected
//! to poll. Dropping the queue aborts the worker and the job it is running.

use crate::error::{PipelineError, PipelineResult};
use crate::job::{JobId, JobStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Work executed for each job. Receives the job id and its cancel flag.
pub type JobRunner = Arc<dyn Fn(JobId, Arc<AtomicBool>) -> BoxFuture<'static, PipelineResult<()>> + Send + Sync>;

/// Wraps an async closure as a [`JobRunner`].
pub fn job_runner<F, Fut>(f: F) -> JobRunner
where
    F: Fn(JobId, Arc<AtomicBool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PipelineResult<()>> + Send + 'static,
{
    Arc::new(move |job_id, cancel| f(job_id, cancel).boxed())
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    cancel: Arc<AtomicBool>,
    submitted_at: DateTime<Utc>,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Result of [`TrainingQueue::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and will not run.
    Cancelled,
    /// The job is running; its cancel flag has been raised.
    Cancelling,
    /// The job had already finished with this status.
    AlreadyFinished(JobStatus),
}

type JobTable = Arc<Mutex<HashMap<JobId, JobEntry>>>;

/// Task handle and cancel flag of the job the worker is currently awaiting.
type RunningJob = Arc<std::sync::Mutex<Option<(AbortHandle, Arc<AtomicBool>)>>>;

pub struct TrainingQueue {
    sender: mpsc::UnboundedSender<JobId>,
    jobs: JobTable,
    worker: JoinHandle<()>,
    running: RunningJob,
}

impl TrainingQueue {
    /// Spawns the worker on the current runtime.
    #[must_use]
    pub fn start(runner: JobRunner) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let jobs: JobTable = Arc::new(Mutex::new(HashMap::new()));
        let running: RunningJob = Arc::default();
        let worker = tokio::spawn(run_worker(receiver, Arc::clone(&jobs), Arc::clone(&running), runner));
        Self { sender, jobs, worker, running }
    }

    /// Queues a new job and returns its id.
    pub async fn submit(&self) -> PipelineResult<JobId> {
        let job_id = JobId::new();
        let entry = JobEntry {
            status: JobStatus::Queued,
            cancel: Arc::new(AtomicBool::new(false)),
            submitted_at: Utc::now(),
        };
        self.jobs.lock().await.insert(job_id.clone(), entry);

        if self.sender.send(job_id.clone()).is_err() {
            self.jobs.lock().await.remove(&job_id);
            return Err(PipelineError::Queue("training worker has stopped".to_string()));
        }
        info!(job_id = %job_id, "Training job queued");
        Ok(job_id)
    }

    pub async fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.jobs.lock().await.get(job_id).map(|entry| entry.status.clone())
    }

    /// All known jobs, oldest first.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        let mut snapshots: Vec<JobSnapshot> = jobs
            .iter()
            .map(|(id, entry)| JobSnapshot {
                job_id: id.clone(),
                status: entry.status.clone(),
                submitted_at: entry.submitted_at,
            })
            .collect();
        snapshots.sort_by_key(|s| s.submitted_at);
        snapshots
    }

    /// Cancels a job; `None` if the id is unknown.
    pub async fn cancel(&self, job_id: &JobId) -> Option<CancelOutcome> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.get_mut(job_id)?;
        let outcome = match &entry.status {
            JobStatus::Queued => {
                entry.status = JobStatus::Cancelled;
                CancelOutcome::Cancelled
            }
            JobStatus::Running => {
                entry.cancel.store(true, Ordering::Relaxed);
                CancelOutcome::Cancelling
            }
            finished => CancelOutcome::AlreadyFinished(finished.clone()),
        };
        info!(job_id = %job_id, ?outcome, "Cancel requested");
        Some(outcome)
    }
}

impl Drop for TrainingQueue {
    fn drop(&mut self) {
        self.worker.abort();
        // The job runs on its own task, so aborting the worker alone would leave it running.
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((handle, cancel)) = running {
            cancel.store(true, Ordering::Relaxed);
            handle.abort();
            debug!("Aborted running training job on queue shutdown");
        }
    }
}

fn set_running(running: &RunningJob, job: Option<(AbortHandle, Arc<AtomicBool>)>) {
    match running.lock() {
        Ok(mut guard) => *guard = job,
        Err(poisoned) => *poisoned.into_inner() = job,
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<JobId>,
    jobs: JobTable,
    running: RunningJob,
    runner: JobRunner,
) {
    while let Some(job_id) = receiver.recv().await {
        let cancel = {
            let mut table = jobs.lock().await;
            let Some(entry) = table.get_mut(&job_id) else {
                continue;
            };
            if entry.status != JobStatus::Queued {
                debug!(job_id = %job_id, status = entry.status.as_str(), "Skipping job");
                continue;
            }
            entry.status = JobStatus::Running;
            Arc::clone(&entry.cancel)
        };

        info!(job_id = %job_id, "Training job started");
        // A panicking job must not take the worker down with it.
        let task = tokio::spawn(runner(job_id.clone(), Arc::clone(&cancel)));
        set_running(&running, Some((task.abort_handle(), Arc::clone(&cancel))));
        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::from(join_error)),
        };
        set_running(&running, None);

        let status = match result {
            Ok(()) => JobStatus::Succeeded,
            Err(PipelineError::Cancelled) => JobStatus::Cancelled,
            Err(_) if cancel.load(Ordering::Relaxed) => JobStatus::Cancelled,
            Err(e) => JobStatus::Failed(e.to_string()),
        };
        match &status {
            JobStatus::Succeeded => info!(job_id = %job_id, "Training job succeeded"),
            JobStatus::Cancelled => warn!(job_id = %job_id, "Training job cancelled"),
            JobStatus::Failed(reason) => error!(job_id = %job_id, reason = %reason, "Training job failed"),
            JobStatus::Queued | JobStatus::Running => {}
        }
        if let Some(entry) = jobs.lock().await.get_mut(&job_id) {
            entry.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn wait_until_terminal(queue: &TrainingQueue, id: &JobId) -> JobStatus {
        for _ in 0..500 {
            if let Some(status) = queue.status(id).await {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    async fn wait_until_running(queue: &TrainingQueue, id: &JobId) {
        for _ in 0..500 {
            if queue.status(id).await == Some(JobStatus::Running) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never started");
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runner = {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            job_runner(move |_, _| {
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let queue = TrainingQueue::start(runner);

        let first = queue.submit().await.unwrap();
        let second = queue.submit().await.unwrap();
        assert_eq!(wait_until_terminal(&queue, &first).await, JobStatus::Succeeded);
        assert_eq!(wait_until_terminal(&queue, &second).await, JobStatus::Succeeded);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(queue.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_job_records_reason() {
        let runner = job_runner(|_, _| async { Err(PipelineError::Dataset("train split is empty".to_string())) });
        let queue = TrainingQueue::start(runner);
        let id = queue.submit().await.unwrap();

        let status = wait_until_terminal(&queue, &id).await;
        assert_eq!(status, JobStatus::Failed("dataset error: train split is empty".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_queued_job_never_runs() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            job_runner(move |_, _| {
                let gate = Arc::clone(&gate);
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })
        };
        let queue = TrainingQueue::start(runner);

        let first = queue.submit().await.unwrap();
        wait_until_running(&queue, &first).await;
        let second = queue.submit().await.unwrap();
        assert_eq!(queue.cancel(&second).await, Some(CancelOutcome::Cancelled));

        gate.notify_one();
        assert_eq!(wait_until_terminal(&queue, &first).await, JobStatus::Succeeded);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.status(&second).await, Some(JobStatus::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job_sets_flag() {
        let runner = job_runner(|_, cancel| async move {
            while !cancel.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(PipelineError::Cancelled)
        });
        let queue = TrainingQueue::start(runner);
        let id = queue.submit().await.unwrap();
        wait_until_running(&queue, &id).await;

        assert_eq!(queue.cancel(&id).await, Some(CancelOutcome::Cancelling));
        assert_eq!(wait_until_terminal(&queue, &id).await, JobStatus::Cancelled);
        assert_eq!(queue.cancel(&id).await, Some(CancelOutcome::AlreadyFinished(JobStatus::Cancelled)));
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_queue_stops_running_job() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag_seen = Arc::new(Mutex::new(None));
        let runner = {
            let dropped = Arc::clone(&dropped);
            let flag_seen = Arc::clone(&flag_seen);
            job_runner(move |_, cancel| {
                let guard = SetOnDrop(Arc::clone(&dropped));
                let flag_seen = Arc::clone(&flag_seen);
                async move {
                    let _guard = guard;
                    *flag_seen.lock().await = Some(cancel);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            })
        };
        let queue = TrainingQueue::start(runner);
        let id = queue.submit().await.unwrap();
        wait_until_running(&queue, &id).await;
        for _ in 0..100 {
            if flag_seen.lock().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(queue);
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst), "job future still alive after queue was dropped");
        let cancel = flag_seen.lock().await.take().unwrap();
        assert!(cancel.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let runner = job_runner(|_, _| async { Ok(()) });
        let queue = TrainingQueue::start(runner);
        let missing = JobId::from("missing");
        assert_eq!(queue.status(&missing).await, None);
        assert_eq!(queue.cancel(&missing).await, None);
    }
}
