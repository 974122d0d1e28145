use crate::batching::BatchController;
use crate::config::AppConfig;
use crate::demands::{DemandService, DemandSubmission, ResultsDownload};
use crate::error::AppError;
use crate::face::FaceEngine;
use crate::indexer::DirectoryIndexer;
use crate::jobs::{Job, JobHandler, JobOutput, JobQueue, ResultArchive};
use crate::models::{Demand, Directory, IndexProgress, NewDirectory};
use crate::notify::NotificationSink;
use crate::search::{SearchOrchestrator, SearchRequest};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Wires the components together and runs the jobs they dispatch.
pub struct Pipeline {
    pub store: Arc<dyn Store>,
    pub queue: JobQueue,
    pub indexer: DirectoryIndexer,
    pub batching: BatchController,
    pub search: SearchOrchestrator,
    pub demands: DemandService,
}

impl Pipeline {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn Store>,
        engine: Arc<dyn FaceEngine>,
        sink: Arc<dyn NotificationSink>,
        archive: Option<Arc<dyn ResultArchive>>,
    ) -> Arc<Self> {
        let queue = JobQueue::new(&config, archive);
        let indexer =
            DirectoryIndexer::new(store.clone(), engine.clone(), queue.clone(), config.clone());
        let batching = BatchController::new(store.clone(), queue.clone(), config.clone());
        let search = SearchOrchestrator::new(
            store.clone(),
            engine.clone(),
            queue.clone(),
            sink.clone(),
            config.clone(),
        );
        let demands = DemandService::new(
            store.clone(),
            engine,
            queue.clone(),
            sink,
            batching.clone(),
            config,
        );
        Arc::new(Self { store, queue, indexer, batching, search, demands })
    }

    /// Starts the worker pool with this pipeline as the job handler.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.queue.start(self.clone())
    }

    /// Settles work a previous process left behind. Must run before [`Pipeline::start`].
    pub async fn recover(&self) -> Result<(), AppError> {
        let abandoned = self.queue.results().recover().await?;
        let released = self.store.release_claims().await?;
        if abandoned > 0 || released > 0 {
            log::info!(
                "Recovered from restart: {} jobs abandoned, {} demands back to waiting",
                abandoned,
                released
            );
        }
        Ok(())
    }

    /// Creates configured directories that are not in the store yet.
    pub async fn seed_directories(&self, config: &AppConfig) -> Result<Vec<Directory>, AppError> {
        let mut directories = Vec::new();
        for entry in &config.directories {
            let directory = match self.store.find_directory_by_name(&entry.name).await? {
                Some(existing) => existing,
                None => {
                    self.store
                        .create_directory(NewDirectory {
                            name: entry.name.clone(),
                            path: entry.path.clone(),
                            is_visible: entry.is_visible,
                        })
                        .await?
                }
            };
            directories.push(directory);
        }
        Ok(directories)
    }

    pub async fn submit_demand(&self, submission: DemandSubmission) -> Result<Demand, AppError> {
        self.demands.submit(submission).await
    }

    pub async fn trigger_index(&self, directory_id: i64) -> Result<(), AppError> {
        self.indexer.request_index(directory_id).await
    }

    pub async fn trigger_search(&self, directory_id: i64) -> Result<SearchRequest, AppError> {
        let progress = self.indexer.progress(directory_id).await?;
        self.search.request_search(directory_id, progress.status).await
    }

    pub async fn index_progress(&self, directory_id: i64) -> Result<IndexProgress, AppError> {
        self.indexer.progress(directory_id).await
    }

    pub async fn download_results(&self, token: Uuid) -> Result<ResultsDownload, AppError> {
        self.demands.download_results(token).await
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: &Job) -> Result<JobOutput, AppError> {
        match job {
            Job::IndexDirectory { directory_id } => {
                let scheduled = self.indexer.index_directory(*directory_id).await?;
                Ok(format!("{} files scheduled", scheduled))
            }
            Job::EncodePhoto { directory_id, generation, path } => {
                self.indexer.encode_photo(*directory_id, *generation, path).await
            }
            Job::EncodeDemand { demand_id } => self.demands.encode_demand(*demand_id).await,
            Job::FindFaces { query, photo_id } => self.search.find_faces(query, *photo_id).await,
            Job::SearchPhotos { directory_id } => self.search.search_photos(*directory_id).await,
            Job::SearchEnding { group_id, demand_ids } => {
                self.search.finalize(*group_id, demand_ids).await
            }
            Job::ErrorMail { demand_id, error } => {
                self.demands.send_error_mail(*demand_id, error).await
            }
            Job::CheckPendingSearches => {
                let directories = self.batching.sweep().await?;
                let purged = self.queue.results().purge_expired().await?;
                Ok(format!(
                    "{} searches scheduled, {} expired results purged",
                    directories.len(),
                    purged
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DirectoryConfig;
    use crate::models::{IndexingStatus, ProcessingStatus};
    use crate::search::SearchRequest;
    use crate::store::Store;
    use crate::testing::{waiting_demand, TestPipeline};
    use crate::error::AppError;
    use std::fs;

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let t = TestPipeline::start().await;
        let photos = tempfile::tempdir().unwrap();
        let mut config = (*t.config).clone();
        config.directories = vec![DirectoryConfig {
            name: "Gala".into(),
            path: photos.path().to_path_buf(),
            is_visible: true,
        }];

        let first = t.pipeline.seed_directories(&config).await.unwrap();
        let second = t.pipeline.seed_directories(&config).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(t.store.list_directories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn index_then_forced_search_end_to_end() {
        let t = TestPipeline::start().await;
        let photos = tempfile::tempdir().unwrap();
        fs::write(photos.path().join("crowd.jpg"), b"x").unwrap();
        fs::write(photos.path().join("empty.jpg"), b"x").unwrap();
        t.engine.set_faces(photos.path().join("crowd.jpg"), vec![vec![2.0, 2.0], vec![0.0, 0.0]]);

        let mut config = (*t.config).clone();
        config.directories = vec![DirectoryConfig {
            name: "Gala".into(),
            path: photos.path().to_path_buf(),
            is_visible: true,
        }];
        let dir = t.pipeline.seed_directories(&config).await.unwrap().remove(0);

        assert!(matches!(t.pipeline.trigger_search(dir.id).await, Err(AppError::Conflict(_))));

        t.pipeline.trigger_index(dir.id).await.unwrap();
        t.pipeline.queue.wait_idle().await;
        let progress = t.pipeline.index_progress(dir.id).await.unwrap();
        assert_eq!(progress.status, IndexingStatus::Indexed);
        assert_eq!(progress.indexed_photos, 2);

        let demand = waiting_demand(&t, dir.id, "a", vec![2.1, 2.0]).await;
        assert_eq!(t.pipeline.trigger_search(dir.id).await.unwrap(), SearchRequest::Started);
        t.pipeline.queue.wait_idle().await;

        let demand = t.store.get_demand(demand.id).await.unwrap().unwrap();
        assert_eq!(demand.processing_status, ProcessingStatus::Processed);
        assert_eq!(demand.photos.len(), 1);
        assert_eq!(t.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn recovery_returns_interrupted_searches_to_waiting() {
        let t = TestPipeline::start_paused().await;
        let photos = tempfile::tempdir().unwrap();
        let dir = crate::testing::add_directory(&t, photos.path()).await;
        let demand = waiting_demand(&t, dir.id, "a", vec![0.0]).await;
        t.store.claim_waiting(dir.id, uuid::Uuid::new_v4()).await.unwrap();

        t.pipeline.recover().await.unwrap();
        let demand = t.store.get_demand(demand.id).await.unwrap().unwrap();
        assert_eq!(demand.processing_status, ProcessingStatus::WaitingForSearch);
        assert!(demand.search_task_id.is_none());
        assert_eq!(t.store.waiting_demands(Some(dir.id), None).await.unwrap().len(), 1);
    }
}
