use super::{GroupId, Job, JobHandler, JobId, JobState, ResultArchive, ResultBackend, RetryPolicy};
use crate::config::AppConfig;
use crate::error::AppError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug)]
struct WorkItem {
    id: JobId,
    job: Job,
    attempt: u32,
}

/// One unit pulled by a worker: a single job, or a chunk of group members run back to back.
#[derive(Debug)]
struct Envelope {
    group: Option<GroupId>,
    items: Vec<WorkItem>,
}

struct Inner {
    tx: async_channel::Sender<Envelope>,
    rx: async_channel::Receiver<Envelope>,
    backend: ResultBackend,
    retry: RetryPolicy,
    num_workers: usize,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// In-process job queue with chunked groups, join callbacks and bounded retries.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(config: &AppConfig, archive: Option<Arc<dyn ResultArchive>>) -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                backend: ResultBackend::new(config.result_retention(), archive),
                retry: RetryPolicy::new(
                    config.max_retries,
                    Duration::from_millis(config.retry_backoff_ms),
                ),
                num_workers: config.num_workers.max(1),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn results(&self) -> &ResultBackend {
        &self.inner.backend
    }

    /// Spawns the worker pool. Must be called from within a tokio runtime.
    pub fn start(&self, handler: Arc<dyn JobHandler>) -> Vec<JoinHandle<()>> {
        log::info!("Starting job queue with {} workers", self.inner.num_workers);
        (0..self.inner.num_workers)
            .map(|worker| {
                let queue = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move { queue.run_worker(worker, handler).await })
            })
            .collect()
    }

    /// Closes the queue; workers exit once the backlog is drained.
    pub fn close(&self) {
        self.inner.tx.close();
    }

    pub async fn submit(&self, job: Job) -> Result<JobId, AppError> {
        let id = Uuid::new_v4();
        log::debug!("Submitting job {} ({})", job.name(), id);
        self.inner.backend.register_job(id).await?;
        self.enqueue(Envelope {
            group: None,
            items: vec![WorkItem { id, job, attempt: 0 }],
        })?;
        Ok(id)
    }

    /// Submits `jobs` as one trackable group, `chunk_size` jobs per worker envelope.
    ///
    /// With a callback the group starts with its join barrier closed: the
    /// callback is only scheduled after [`JobQueue::seal`] and once every member
    /// reached a terminal state.
    pub async fn submit_chunks(
        &self,
        group_id: GroupId,
        jobs: Vec<Job>,
        chunk_size: usize,
        callback: Option<Job>,
    ) -> Result<GroupId, AppError> {
        let items: Vec<WorkItem> = jobs
            .into_iter()
            .map(|job| WorkItem { id: Uuid::new_v4(), job, attempt: 0 })
            .collect();
        log::debug!(
            "Submitting group {} with {} jobs in chunks of {}",
            group_id,
            items.len(),
            chunk_size
        );

        let children = items.iter().map(|item| item.id).collect();
        if let Some(ready) = self.inner.backend.register_group(group_id, children, callback).await? {
            self.submit(ready).await?;
        }

        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<WorkItem> = items.by_ref().take(chunk_size.max(1)).collect();
            self.enqueue(Envelope { group: Some(group_id), items: chunk })?;
        }
        Ok(group_id)
    }

    /// Opens the join barrier of a group created with a callback.
    pub async fn seal(&self, group_id: GroupId) -> Result<(), AppError> {
        if let Some(callback) = self.inner.backend.seal(group_id).await? {
            self.submit(callback).await?;
        }
        Ok(())
    }

    /// Resolves once nothing is queued, running or waiting for a retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), AppError> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.inner.tx.try_send(envelope).is_err() {
            self.finish_one();
            return Err(AppError::QueueClosed);
        }
        Ok(())
    }

    fn finish_one(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    async fn run_worker(&self, worker: usize, handler: Arc<dyn JobHandler>) {
        log::debug!("Worker {} started", worker);
        while let Ok(envelope) = self.inner.rx.recv().await {
            for item in envelope.items {
                self.execute(envelope.group, item, handler.as_ref()).await;
            }
            self.finish_one();
        }
        log::debug!("Worker {} stopped", worker);
    }

    async fn execute(&self, group: Option<GroupId>, item: WorkItem, handler: &dyn JobHandler) {
        log::debug!("Running job {} ({}) attempt {}", item.job.name(), item.id, item.attempt);
        let outcome = AssertUnwindSafe(handler.handle(&item.job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AppError::Generic(format!("job {} panicked", item.job.name()))));

        let state = match outcome {
            Ok(output) => {
                log::debug!("Job {} ({}) succeeded: {}", item.job.name(), item.id, output);
                JobState::Success(output)
            }
            Err(e) if item.job.is_retryable() && self.inner.retry.should_retry(item.attempt) => {
                log::warn!(
                    "Job {} ({}) failed on attempt {}: {}. Retrying.",
                    item.job.name(),
                    item.id,
                    item.attempt,
                    e
                );
                let attempt = item.attempt + 1;
                if let Err(e) = self.inner.backend.record(group, item.id, JobState::Retry(attempt)).await {
                    log::error!("Could not record retry of job {}: {}", item.id, e);
                }
                self.schedule_retry(group, WorkItem { attempt, ..item });
                return;
            }
            Err(e) => {
                log::error!("Job {} ({}) failed: {}", item.job.name(), item.id, e);
                JobState::Failure(e.to_string())
            }
        };

        match self.inner.backend.record(group, item.id, state).await {
            Ok(Some(callback)) => {
                if let Err(e) = self.submit(callback).await {
                    log::error!("Could not schedule callback of group {:?}: {}", group, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::error!("Could not record result of job {}: {}", item.id, e),
        }
    }

    fn schedule_retry(&self, group: Option<GroupId>, item: WorkItem) {
        let delay = self.inner.retry.backoff(item.attempt - 1);
        // counted as in flight while it sleeps
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = item.id;
            if let Err(e) = queue.enqueue(Envelope { group, items: vec![item] }) {
                log::error!("Could not re-enqueue job {}: {}", id, e);
            }
            queue.finish_one();
        });
    }
}
