//! Records for directories, photos and demands.

#[cfg(test)]
mod memory;
mod sqlite;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::AppError;
use crate::jobs::GroupId;
use crate::models::{Demand, Directory, NewDemand, NewDirectory, NewPhoto, Photo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistent records for directories, photos and demands.
///
/// Writes are single-row or single-link operations so that jobs delivered more
/// than once leave the same state behind.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_directory(&self, new: NewDirectory) -> Result<Directory, AppError>;
    async fn get_directory(&self, id: i64) -> Result<Option<Directory>, AppError>;
    async fn find_directory_by_name(&self, name: &str) -> Result<Option<Directory>, AppError>;
    async fn list_directories(&self) -> Result<Vec<Directory>, AppError>;
    /// Overwrites every column except the generation, which only
    /// `begin_generation` moves.
    async fn update_directory(&self, directory: &Directory) -> Result<(), AppError>;

    /// Bumps the directory generation and deletes its photos, with their
    /// demand links, in one step. Returns the updated directory and how many
    /// photos were removed.
    async fn begin_generation(&self, directory_id: i64) -> Result<(Directory, usize), AppError>;
    /// Stores the outcome of the walk of an index run. Returns `false`, leaving
    /// the row untouched, when `generation` is no longer current.
    async fn record_index_run(
        &self,
        directory_id: i64,
        generation: u64,
        total_photos: usize,
        indexing_task_id: GroupId,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Returns `None` when the photo belongs to a superseded index run.
    async fn create_photo(&self, new: NewPhoto) -> Result<Option<Photo>, AppError>;
    async fn get_photo(&self, id: i64) -> Result<Option<Photo>, AppError>;
    async fn get_photos(&self, ids: &[i64]) -> Result<Vec<Photo>, AppError>;
    /// Photos of the current generation only.
    async fn photo_ids_for_directory(&self, directory_id: i64) -> Result<Vec<i64>, AppError>;
    /// Photos of the current generation only.
    async fn count_photos(&self, directory_id: i64) -> Result<usize, AppError>;

    async fn create_demand(&self, new: NewDemand) -> Result<Demand, AppError>;
    async fn get_demand(&self, id: i64) -> Result<Option<Demand>, AppError>;
    async fn get_demand_by_token(&self, token: Uuid) -> Result<Option<Demand>, AppError>;
    /// Overwrites every column except the match set, which only `add_match`
    /// and photo deletion change.
    async fn update_demand(&self, demand: &Demand) -> Result<(), AppError>;
    async fn delete_demand(&self, id: i64) -> Result<Option<Demand>, AppError>;
    async fn recent_demand_exists(
        &self,
        directory_id: i64,
        name: &str,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Demands waiting for a search with a face vector, optionally restricted
    /// to one directory and to those submitted before `older_than`.
    async fn waiting_demands(
        &self,
        directory_id: Option<i64>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Demand>, AppError>;
    /// Selects the waiting demands of a directory and moves them to PROCESSING
    /// under `search_task_id` in one step. A demand is claimed by one search at most.
    async fn claim_waiting(
        &self,
        directory_id: i64,
        search_task_id: GroupId,
    ) -> Result<Vec<Demand>, AppError>;
    /// Puts demands left PROCESSING by a search that did not survive a restart
    /// back to WAITING_FOR_SEARCH.
    async fn release_claims(&self) -> Result<usize, AppError>;
    /// Links a photo to a demand. Returns `false` when the link already existed.
    async fn add_match(&self, demand_id: i64, photo_id: i64) -> Result<bool, AppError>;
}
