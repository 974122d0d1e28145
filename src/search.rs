use crate::config::AppConfig;
use crate::error::AppError;
use crate::face::FaceEngine;
use crate::jobs::{GroupId, Job, JobQueue, QuerySet};
use crate::models::{FaceVector, IndexingStatus, ProcessingStatus};
use crate::notify::{self, NotificationSink};
use crate::store::Store;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchRequest {
    Started,
    NothingToSearch,
}

/// Fans compare jobs out over a directory's photos and finalizes the batch
/// once they have all finished.
#[derive(Clone)]
pub struct SearchOrchestrator {
    store: Arc<dyn Store>,
    engine: Arc<dyn FaceEngine>,
    queue: JobQueue,
    sink: Arc<dyn NotificationSink>,
    config: Arc<AppConfig>,
}

impl SearchOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<dyn FaceEngine>,
        queue: JobQueue,
        sink: Arc<dyn NotificationSink>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { store, engine, queue, sink, config }
    }

    pub async fn search_photos(&self, directory_id: i64) -> Result<String, AppError> {
        let group_id: GroupId = Uuid::new_v4();
        let demands = self.store.claim_waiting(directory_id, group_id).await?;
        if demands.is_empty() {
            return Ok("No demand to search".to_string());
        }

        let mut query = QuerySet {
            demand_ids: Vec::with_capacity(demands.len()),
            encodings: Vec::with_capacity(demands.len()),
        };
        for demand in demands {
            if let Some(encoding) = demand.face_encoding {
                query.demand_ids.push(demand.id);
                query.encodings.push(encoding);
            }
        }
        let demand_ids = query.demand_ids.clone();
        let query = Arc::new(query);

        let photo_ids = self.store.photo_ids_for_directory(directory_id).await?;
        log::info!(
            "Searching {} demands across {} photos of directory {}",
            demand_ids.len(),
            photo_ids.len(),
            directory_id
        );
        let jobs = photo_ids
            .into_iter()
            .map(|photo_id| Job::FindFaces { query: query.clone(), photo_id })
            .collect();

        let claimed = demand_ids.len();
        self.queue
            .submit_chunks(
                group_id,
                jobs,
                self.config.face_searching_chunk_size,
                Some(Job::SearchEnding { group_id, demand_ids }),
            )
            .await?;
        self.queue.seal(group_id).await?;

        Ok(format!(
            "Search started in directory {} for {} demands",
            directory_id, claimed
        ))
    }

    /// Body of a compare job: links the photo to every demand one of its faces matches.
    pub async fn find_faces(&self, query: &QuerySet, photo_id: i64) -> Result<String, AppError> {
        let photo = match self.store.get_photo(photo_id).await? {
            Some(photo) => photo,
            None => return Ok(format!("Photo not found: id = {}", photo_id)),
        };

        let engine = self.engine.clone();
        let encodings = query.encodings.clone();
        let tolerance = self.config.face_matching_threshold;
        let matches = tokio::task::spawn_blocking(move || {
            match_photo(engine.as_ref(), &photo.face_encodings, &encodings, tolerance)
        })
        .await?;

        let mut linked = 0;
        for (demand_id, matched) in query.demand_ids.iter().zip(matches) {
            if !matched {
                continue;
            }
            match self.store.add_match(*demand_id, photo_id).await {
                Ok(_) => linked += 1,
                Err(AppError::NotFound(what)) => {
                    log::debug!("Match for photo {} skipped, {} is gone", photo_id, what);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(format!("ok ({} matches)", linked))
    }

    /// Join callback of a search batch. Demands since reset or claimed by another
    /// search are left alone.
    pub async fn finalize(&self, group_id: GroupId, demand_ids: &[i64]) -> Result<String, AppError> {
        let mut messages = Vec::new();

        for demand_id in demand_ids {
            let mut demand = match self.store.get_demand(*demand_id).await? {
                Some(demand) => demand,
                None => {
                    log::debug!("Demand {} disappeared before its search ended", demand_id);
                    continue;
                }
            };
            if demand.search_task_id != Some(group_id) {
                log::debug!("Demand {} no longer belongs to search {}", demand_id, group_id);
                continue;
            }
            demand.processing_status = ProcessingStatus::Processed;
            match self.store.update_demand(&demand).await {
                Ok(()) => {}
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }

            let directory_name = self
                .store
                .get_directory(demand.directory_id)
                .await?
                .map(|d| d.name)
                .unwrap_or_default();
            let message = if demand.photos.is_empty() {
                notify::no_results(&directory_name, &demand)
            } else {
                match notify::results_ready(&self.config.base_url, &directory_name, &demand) {
                    Ok(message) => message,
                    Err(e) => {
                        log::error!("Could not compose results for demand {}: {}", demand.id, e);
                        continue;
                    }
                }
            };
            messages.push(message);
        }

        let count = messages.len();
        if let Err(e) = self.sink.send_batch(messages).await {
            log::error!("Failed to send {} search notifications: {}", count, e);
        }
        Ok("Search ended".to_string())
    }

    /// Search requested by an operator: only for indexed directories with waiting demands.
    pub async fn request_search(
        &self,
        directory_id: i64,
        status: IndexingStatus,
    ) -> Result<SearchRequest, AppError> {
        if status != IndexingStatus::Indexed {
            return Err(AppError::Conflict("Directory not indexed".to_string()));
        }
        if self.store.waiting_demands(Some(directory_id), None).await?.is_empty() {
            return Ok(SearchRequest::NothingToSearch);
        }
        self.queue.submit(Job::SearchPhotos { directory_id }).await?;
        Ok(SearchRequest::Started)
    }
}

/// Whether each query vector matches at least one face of the photo.
pub fn match_photo(
    engine: &dyn FaceEngine,
    photo_faces: &[FaceVector],
    queries: &[FaceVector],
    tolerance: f64,
) -> Vec<bool> {
    let mut matches = vec![false; queries.len()];
    for face in photo_faces {
        let compared = engine.compare(queries, face, tolerance);
        for (matched, hit) in matches.iter_mut().zip(compared) {
            *matched |= hit;
        }
    }
    matches
}
