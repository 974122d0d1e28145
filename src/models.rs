// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::path::PathBuf;
use uuid::Uuid;

use crate::jobs::GroupId;

pub type FaceVector = Vec<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    NotProcessed,
    FaceEncoding,
    NoFaceFound,
    WaitingForSearch,
    Processing,
    Processed,
}

impl ProcessingStatus {
    /// States in which a demand carries its face vector.
    pub fn has_encoding(self) -> bool {
        matches!(
            self,
            ProcessingStatus::WaitingForSearch
                | ProcessingStatus::Processing
                | ProcessingStatus::Processed
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessingStatus::NotProcessed => "NOT_PROCESSED",
            ProcessingStatus::FaceEncoding => "FACE_ENCODING",
            ProcessingStatus::NoFaceFound => "NO_FACE_FOUND",
            ProcessingStatus::WaitingForSearch => "WAITING_FOR_SEARCH",
            ProcessingStatus::Processing => "PROCESSING",
            ProcessingStatus::Processed => "PROCESSED",
        };
        f.write_str(s)
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_PROCESSED" => Ok(ProcessingStatus::NotProcessed),
            "FACE_ENCODING" => Ok(ProcessingStatus::FaceEncoding),
            "NO_FACE_FOUND" => Ok(ProcessingStatus::NoFaceFound),
            "WAITING_FOR_SEARCH" => Ok(ProcessingStatus::WaitingForSearch),
            "PROCESSING" => Ok(ProcessingStatus::Processing),
            "PROCESSED" => Ok(ProcessingStatus::Processed),
            other => Err(format!("unknown processing status {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexingStatus {
    NotIndexed,
    Indexing,
    Indexed,
    Error,
}

impl fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexingStatus::NotIndexed => "NOT_INDEXED",
            IndexingStatus::Indexing => "INDEXING",
            IndexingStatus::Indexed => "INDEXED",
            IndexingStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Demand {
    pub id: i64,
    pub directory_id: i64,
    pub name: String,
    pub first_name: String,
    pub email: String,
    /// Uploaded image, removed once the face has been encoded.
    pub upload: Option<PathBuf>,
    pub date: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub face_encoding: Option<FaceVector>,
    pub photos: BTreeSet<i64>,
    pub search_task_id: Option<GroupId>,
    pub request_token: Uuid,
}

impl Demand {
    pub fn is_processed(&self) -> bool {
        self.processing_status == ProcessingStatus::Processed
    }
}

#[derive(Debug, Clone)]
pub struct NewDemand {
    pub directory_id: i64,
    pub name: String,
    pub first_name: String,
    pub email: String,
    pub upload: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Directory {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
    pub is_visible: bool,
    pub indexing_task_id: Option<GroupId>,
    pub total_photos: usize,
    pub last_indexing_date: Option<DateTime<Utc>>,
    /// Bumped by every index run and reset; encode results from older runs are dropped.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct NewDirectory {
    pub name: String,
    pub path: PathBuf,
    pub is_visible: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Photo {
    pub id: i64,
    pub directory_id: i64,
    pub path: PathBuf,
    pub face_encodings: Vec<FaceVector>,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub directory_id: i64,
    pub generation: u64,
    pub path: PathBuf,
    pub face_encodings: Vec<FaceVector>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct IndexProgress {
    pub status: IndexingStatus,
    pub total_photos: usize,
    pub indexed_photos: usize,
}
