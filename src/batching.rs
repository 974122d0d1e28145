use crate::config::AppConfig;
use crate::error::AppError;
use crate::jobs::{Job, JobQueue};
use crate::store::Store;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Decides when pending demands of a directory are worth a search.
#[derive(Clone)]
pub struct BatchController {
    store: Arc<dyn Store>,
    queue: JobQueue,
    config: Arc<AppConfig>,
}

impl BatchController {
    pub fn new(store: Arc<dyn Store>, queue: JobQueue, config: Arc<AppConfig>) -> Self {
        Self { store, queue, config }
    }

    /// Called after a demand of `directory_id` got its face vector. Returns
    /// whether a search was scheduled.
    pub async fn on_demand_encoded(&self, directory_id: i64) -> Result<bool, AppError> {
        let waiting = self.store.waiting_demands(Some(directory_id), None).await?.len();
        if waiting > self.config.face_searching_batch_size {
            log::info!(
                "{} demands waiting in directory {}, scheduling a search",
                waiting,
                directory_id
            );
            self.queue.submit(Job::SearchPhotos { directory_id }).await?;
            return Ok(true);
        }
        log::debug!(
            "{} demands waiting in directory {} (batch size {})",
            waiting,
            directory_id,
            self.config.face_searching_batch_size
        );
        Ok(false)
    }

    /// Schedules a search for every directory holding a demand that waited
    /// longer than allowed. Returns the affected directories.
    pub async fn sweep(&self) -> Result<Vec<i64>, AppError> {
        let cutoff = Utc::now() - self.config.max_waiting_time();
        let directories: BTreeSet<i64> = self
            .store
            .waiting_demands(None, Some(cutoff))
            .await?
            .into_iter()
            .map(|demand| demand.directory_id)
            .collect();

        for directory_id in &directories {
            log::info!("Demands in directory {} waited too long, scheduling a search", directory_id);
            self.queue.submit(Job::SearchPhotos { directory_id: *directory_id }).await?;
        }
        Ok(directories.into_iter().collect())
    }
}

/// Submits the pending-search check on a fixed interval.
pub fn start_sweeper(queue: JobQueue, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = queue.submit(Job::CheckPendingSearches).await {
                log::error!("Could not schedule pending search check: {}", e);
                break;
            }
        }
    })
}
