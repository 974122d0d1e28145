//! Background jobs: the payloads the pipeline dispatches, the worker pool that
//! runs them and the result backend that tracks groups of them.

mod queue;
mod results;
mod retry;

pub use queue::JobQueue;
pub use results::{ChildStatus, GroupResult, JobState, ResultArchive, ResultBackend};
pub use retry::RetryPolicy;

use crate::error::AppError;
use crate::models::FaceVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub type JobId = Uuid;
pub type GroupId = Uuid;

/// Message a job body returns on success.
pub type JobOutput = String;

/// Face vectors of a search batch, shared by every compare job of the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySet {
    pub demand_ids: Vec<i64>,
    pub encodings: Vec<FaceVector>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    IndexDirectory { directory_id: i64 },
    EncodePhoto { directory_id: i64, generation: u64, path: PathBuf },
    EncodeDemand { demand_id: i64 },
    FindFaces { query: Arc<QuerySet>, photo_id: i64 },
    SearchPhotos { directory_id: i64 },
    SearchEnding { group_id: GroupId, demand_ids: Vec<i64> },
    ErrorMail { demand_id: i64, error: String },
    CheckPendingSearches,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::IndexDirectory { .. } => "index_directory",
            Job::EncodePhoto { .. } => "encode_photo",
            Job::EncodeDemand { .. } => "encode_demand",
            Job::FindFaces { .. } => "find_faces",
            Job::SearchPhotos { .. } => "search_photos",
            Job::SearchEnding { .. } => "search_ending",
            Job::ErrorMail { .. } => "error_mail",
            Job::CheckPendingSearches => "check_pending_searches",
        }
    }

    /// Only photo encoding is retried; every other job fails on its first error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Job::EncodePhoto { .. })
    }
}

/// Executes job bodies on behalf of the worker pool.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobOutput, AppError>;
}
