use crate::config::AppConfig;
use crate::error::AppError;
use crate::face::FaceEngine;
use crate::jobs::{GroupId, Job, JobQueue};
use crate::models::{Directory, IndexProgress, IndexingStatus, NewPhoto};
use crate::status::indexing_status;
use crate::store::Store;
use crate::walker;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Walks directories and turns each file into a `Photo` through encode jobs.
#[derive(Clone)]
pub struct DirectoryIndexer {
    store: Arc<dyn Store>,
    engine: Arc<dyn FaceEngine>,
    queue: JobQueue,
    config: Arc<AppConfig>,
}

impl DirectoryIndexer {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<dyn FaceEngine>,
        queue: JobQueue,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { store, engine, queue, config }
    }

    async fn load(&self, directory_id: i64) -> Result<Directory, AppError> {
        self.store
            .get_directory(directory_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("directory {}", directory_id)))
    }

    /// Rebuilds the photo index of a directory from scratch and returns how
    /// many files were scheduled for encoding.
    pub async fn index_directory(&self, directory_id: i64) -> Result<usize, AppError> {
        // encode results of older runs are refused from here on
        let (directory, removed) = self.store.begin_generation(directory_id).await?;
        log::info!(
            "Indexing directory {} ({:?}), generation {}",
            directory.name,
            directory.path,
            directory.generation
        );
        log::debug!("Removed {} photos from previous runs of {}", removed, directory.name);

        let paths = walker::collect_files(directory.path.clone()).await?;
        let total = paths.len();

        let group_id: GroupId = Uuid::new_v4();
        let current = self
            .store
            .record_index_run(directory_id, directory.generation, total, group_id, Utc::now())
            .await?;
        if !current {
            log::info!(
                "Index run {} of {} was superseded while walking, nothing scheduled",
                directory.generation,
                directory.name
            );
            return Ok(0);
        }

        let jobs = paths
            .into_iter()
            .map(|path| Job::EncodePhoto {
                directory_id,
                generation: directory.generation,
                path,
            })
            .collect();
        self.queue
            .submit_chunks(group_id, jobs, self.config.indexing_chunk_size, None)
            .await?;

        log::info!(
            "Scheduled {} files of {} for encoding (group {})",
            total,
            directory.name,
            group_id
        );
        Ok(total)
    }

    /// Body of an encode job: detects the faces of one file and stores the photo.
    pub async fn encode_photo(
        &self,
        directory_id: i64,
        generation: u64,
        path: &PathBuf,
    ) -> Result<String, AppError> {
        let directory = self.load(directory_id).await?;
        if directory.generation != generation {
            return Ok(format!("Skipped {:?}: index run superseded", path));
        }

        let engine = self.engine.clone();
        let image = path.clone();
        let face_encodings =
            tokio::task::spawn_blocking(move || engine.detect_and_encode(&image)).await??;
        let faces = face_encodings.len();

        let photo = self
            .store
            .create_photo(NewPhoto {
                directory_id,
                generation,
                path: path.clone(),
                face_encodings,
            })
            .await?;
        match photo {
            Some(photo) => {
                log::debug!("Indexed {:?} as photo {} with {} faces", path, photo.id, faces);
                Ok("ok".to_string())
            }
            None => Ok(format!("Skipped {:?}: index run superseded", path)),
        }
    }

    pub async fn progress(&self, directory_id: i64) -> Result<IndexProgress, AppError> {
        let directory = self.load(directory_id).await?;
        self.progress_of(&directory).await
    }

    pub async fn progress_of(&self, directory: &Directory) -> Result<IndexProgress, AppError> {
        let indexed_photos = self.store.count_photos(directory.id).await?;
        let group = match directory.indexing_task_id {
            Some(group_id) => self.queue.results().restore_group(group_id).await?,
            None => None,
        };
        Ok(IndexProgress {
            status: indexing_status(directory.total_photos, indexed_photos, group.as_ref()),
            total_photos: directory.total_photos,
            indexed_photos,
        })
    }

    /// Schedules an index run unless one is already in progress.
    pub async fn request_index(&self, directory_id: i64) -> Result<(), AppError> {
        let progress = self.progress(directory_id).await?;
        log::debug!("Index requested for directory {} ({})", directory_id, progress.status);
        if progress.status == IndexingStatus::Indexing {
            return Err(AppError::Conflict("Indexing in progress".to_string()));
        }
        self.queue.submit(Job::IndexDirectory { directory_id }).await?;
        Ok(())
    }

    /// Forgets everything indexed for the directory.
    pub async fn reset_directory(&self, directory_id: i64) -> Result<usize, AppError> {
        let (mut directory, removed) = self.store.begin_generation(directory_id).await?;
        directory.indexing_task_id = None;
        directory.total_photos = 0;
        directory.last_indexing_date = None;
        self.store.update_directory(&directory).await?;
        log::info!("Reset directory {}, {} photos removed", directory.name, removed);
        Ok(removed)
    }
}
