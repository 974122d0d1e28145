use crate::batching::BatchController;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::face::{DisabledEngine, FaceEngine};
use crate::jobs::{Job, JobQueue};
use crate::models::{Demand, NewDemand, ProcessingStatus};
use crate::notify::{self, NotificationSink};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DemandSubmission {
    pub directory_id: i64,
    pub name: String,
    pub first_name: String,
    pub email: String,
    /// Original file name of the upload, only its extension is kept.
    pub filename: Option<String>,
    pub image: Vec<u8>,
}

#[derive(Debug)]
pub enum ResultsDownload {
    NotReady,
    NoMatches,
    /// A matched photo is no longer on disk.
    Unavailable,
    Archive { filename: String, bytes: Vec<u8> },
}

/// Lifecycle of face-search demands, from upload to result download.
#[derive(Clone)]
pub struct DemandService {
    store: Arc<dyn Store>,
    engine: Arc<dyn FaceEngine>,
    queue: JobQueue,
    sink: Arc<dyn NotificationSink>,
    batching: BatchController,
    config: Arc<AppConfig>,
}

impl DemandService {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<dyn FaceEngine>,
        queue: JobQueue,
        sink: Arc<dyn NotificationSink>,
        batching: BatchController,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { store, engine, queue, sink, batching, config }
    }

    async fn load(&self, demand_id: i64) -> Result<Demand, AppError> {
        self.store
            .get_demand(demand_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("demand {}", demand_id)))
    }

    pub async fn submit(&self, submission: DemandSubmission) -> Result<Demand, AppError> {
        let directory = self
            .store
            .get_directory(submission.directory_id)
            .await?
            .filter(|d| d.is_visible)
            .ok_or_else(|| AppError::NotFound(format!("directory {}", submission.directory_id)))?;
        if submission.image.is_empty() {
            return Err(AppError::Invalid("a photo is required".to_string()));
        }

        let since = Utc::now() - self.config.min_time_between_demands();
        if self
            .store
            .recent_demand_exists(directory.id, &submission.name, &submission.email, since)
            .await?
        {
            return Err(AppError::Conflict(
                "An identical demand was made recently, please wait".to_string(),
            ));
        }

        let upload = self.save_upload(&submission).await?;
        let demand = self
            .store
            .create_demand(NewDemand {
                directory_id: directory.id,
                name: submission.name,
                first_name: submission.first_name,
                email: submission.email,
                upload: Some(upload),
            })
            .await?;
        self.queue.submit(Job::EncodeDemand { demand_id: demand.id }).await?;
        log::info!("Demand {} submitted for directory {}", demand.id, directory.name);
        Ok(demand)
    }

    async fn save_upload(&self, submission: &DemandSubmission) -> Result<PathBuf, AppError> {
        let extension = submission
            .filename
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .unwrap_or_else(|| "jpg".to_string());
        tokio::fs::create_dir_all(&self.config.upload_directory).await?;
        let path = self
            .config
            .upload_directory
            .join(format!("{}.{}", Uuid::new_v4(), extension));
        tokio::fs::write(&path, &submission.image).await?;
        Ok(path)
    }

    /// Body of the demand encode job.
    pub async fn encode_demand(&self, demand_id: i64) -> Result<String, AppError> {
        let mut demand = self.load(demand_id).await?;
        demand.processing_status = ProcessingStatus::FaceEncoding;
        self.store.update_demand(&demand).await?;

        let upload = demand
            .upload
            .clone()
            .ok_or_else(|| AppError::Invalid(format!("demand {} has no photo", demand_id)))?;

        let encoding = if self.engine.is_enabled() {
            let engine = self.engine.clone();
            let detected = tokio::task::spawn_blocking(move || engine.detect_and_encode(&upload)).await?;
            let faces = match detected {
                Ok(faces) => faces,
                Err(e) => {
                    log::warn!(
                        "Face detection failed for demand {}, it stays in {}: {}",
                        demand_id,
                        demand.processing_status,
                        e
                    );
                    return Err(e);
                }
            };
            // first face only, group photos are not disambiguated
            faces.into_iter().next()
        } else {
            Some(DisabledEngine::placeholder_encoding())
        };

        let encoding = match encoding {
            Some(encoding) => encoding,
            None => {
                demand.processing_status = ProcessingStatus::NoFaceFound;
                self.store.update_demand(&demand).await?;
                self.queue
                    .submit(Job::ErrorMail {
                        demand_id,
                        error: "No face found".to_string(),
                    })
                    .await?;
                return Ok("No face found in photo".to_string());
            }
        };

        demand.face_encoding = Some(encoding);
        demand.processing_status = ProcessingStatus::WaitingForSearch;
        if let Some(upload) = demand.upload.take() {
            remove_upload(&upload).await;
        }
        self.store.update_demand(&demand).await?;

        log::debug!("Demand {} is now {}", demand.id, demand.processing_status);

        self.batching.on_demand_encoded(demand.directory_id).await?;
        Ok("ok".to_string())
    }

    pub async fn send_error_mail(&self, demand_id: i64, error: &str) -> Result<String, AppError> {
        let demand = self.load(demand_id).await?;
        let directory_name = self
            .store
            .get_directory(demand.directory_id)
            .await?
            .map(|d| d.name)
            .unwrap_or_default();
        let message = notify::encoding_error(&directory_name, &demand, error);
        if let Err(e) = self.sink.send_batch(vec![message]).await {
            log::error!("Failed to send error notification for demand {}: {}", demand_id, e);
        }
        Ok("sent".to_string())
    }

    /// Deletes a demand and its uploaded photo.
    pub async fn delete(&self, demand_id: i64) -> Result<bool, AppError> {
        match self.store.delete_demand(demand_id).await? {
            Some(demand) => {
                if let Some(upload) = &demand.upload {
                    remove_upload(upload).await;
                }
                log::info!("Deleted demand {}", demand_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn rerun_encoding(&self, demand_id: i64) -> Result<(), AppError> {
        let demand = self.load(demand_id).await?;
        if demand.upload.is_none() {
            return Err(AppError::Invalid("Demand has no photo".to_string()));
        }
        if !matches!(
            demand.processing_status,
            ProcessingStatus::NotProcessed | ProcessingStatus::NoFaceFound
        ) {
            return Err(AppError::Conflict("Photo already processed".to_string()));
        }
        self.queue.submit(Job::EncodeDemand { demand_id }).await?;
        Ok(())
    }

    /// Puts encoded demands back in the search queue. Returns how many were reset.
    pub async fn reset_search(&self, demand_ids: &[i64]) -> Result<usize, AppError> {
        let mut reset = 0;
        for demand_id in demand_ids {
            let mut demand = match self.store.get_demand(*demand_id).await? {
                Some(demand) => demand,
                None => continue,
            };
            if demand.face_encoding.is_none() || !demand.processing_status.has_encoding() {
                log::warn!(
                    "Demand {} is {} without a usable face vector, not resetting its search",
                    demand_id,
                    demand.processing_status
                );
                continue;
            }
            demand.processing_status = ProcessingStatus::WaitingForSearch;
            demand.search_task_id = None;
            self.store.update_demand(&demand).await?;
            reset += 1;
        }
        Ok(reset)
    }

    pub async fn download_results(&self, token: Uuid) -> Result<ResultsDownload, AppError> {
        let demand = self
            .store
            .get_demand_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound("demand".to_string()))?;
        if !demand.is_processed() {
            return Ok(ResultsDownload::NotReady);
        }
        if demand.photos.is_empty() {
            return Ok(ResultsDownload::NoMatches);
        }

        let ids: Vec<i64> = demand.photos.iter().copied().collect();
        let paths: Vec<PathBuf> = self
            .store
            .get_photos(&ids)
            .await?
            .into_iter()
            .map(|p| p.path)
            .collect();
        let archive = tokio::task::spawn_blocking(move || zip_photos(&paths)).await?;
        match archive {
            Ok(bytes) => Ok(ResultsDownload::Archive {
                filename: archive_filename(&demand.name),
                bytes,
            }),
            Err(AppError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Photos of demand {} are no longer available: {}", demand.id, e);
                Ok(ResultsDownload::Unavailable)
            }
            Err(e) => Err(e),
        }
    }
}

/// Name offered for the results archive, restricted to characters safe in a header value.
fn archive_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    format!("photos_{}.zip", safe)
}

async fn remove_upload(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed upload {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove upload {:?}: {}", path, e),
    }
}

fn zip_photos(paths: &[PathBuf]) -> Result<Vec<u8>, AppError> {
    let mut buffer = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buffer));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        let mut used = HashSet::new();
        for (index, path) in paths.iter().enumerate() {
            let base = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("photo_{}", index));
            let name = if used.insert(base.clone()) {
                base
            } else {
                let unique = format!("{}_{}", index, base);
                used.insert(unique.clone());
                unique
            };
            let bytes = std::fs::read(path)?;
            zip.start_file(name, options)?;
            zip.write_all(&bytes)?;
        }
        zip.finish()?;
    }
    Ok(buffer)
}
