//! Fixtures shared by the unit tests.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::face::{DisabledEngine, FaceEngine};
use crate::models::{Demand, Directory, FaceVector, NewDemand, NewDirectory, NewPhoto, Photo, ProcessingStatus};
use crate::notify::{Notification, NotificationSink};
use crate::pipeline::Pipeline;
use crate::store::{MemoryStore, Store};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_config() -> AppConfig {
    AppConfig {
        num_workers: 3,
        retry_backoff_ms: 0,
        simulated_encode_delay_ms: 0,
        indexing_chunk_size: 2,
        face_searching_chunk_size: 2,
        ..AppConfig::default()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_batch(&self, messages: Vec<Notification>) -> Result<usize, AppError> {
        let count = messages.len();
        self.sent.lock().unwrap().extend(messages);
        Ok(count)
    }
}

/// Face engine with scripted detections and transient failures.
#[derive(Default)]
pub struct StubEngine {
    faces: Mutex<HashMap<PathBuf, Vec<FaceVector>>>,
    fallback: Mutex<Vec<FaceVector>>,
    failures: Mutex<HashMap<PathBuf, u32>>,
    attempts: Mutex<HashMap<PathBuf, u32>>,
}

impl StubEngine {
    pub fn set_faces(&self, path: PathBuf, faces: Vec<FaceVector>) {
        self.faces.lock().unwrap().insert(path, faces);
    }

    /// Faces reported for any image without scripted faces.
    pub fn faces_for_any_upload(&self, faces: Vec<FaceVector>) {
        *self.fallback.lock().unwrap() = faces;
    }

    pub fn fail_times(&self, path: PathBuf, times: u32) {
        self.failures.lock().unwrap().insert(path, times);
    }

    pub fn attempts(&self, path: &Path) -> u32 {
        self.attempts.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl FaceEngine for StubEngine {
    fn detect_and_encode(&self, image: &Path) -> Result<Vec<FaceVector>, AppError> {
        *self.attempts.lock().unwrap().entry(image.to_path_buf()).or_insert(0) += 1;
        if let Some(left) = self.failures.lock().unwrap().get_mut(image) {
            if *left > 0 {
                *left -= 1;
                return Err(AppError::Generic(format!("transient failure on {:?}", image)));
            }
        }
        let scripted = self.faces.lock().unwrap().get(image).cloned();
        Ok(scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone()))
    }
}

pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<StubEngine>,
    pub sink: Arc<RecordingSink>,
    pub config: Arc<AppConfig>,
    _uploads: tempfile::TempDir,
}

impl TestPipeline {
    fn build(configure: impl FnOnce(&mut AppConfig), engine: Option<Arc<dyn FaceEngine>>) -> Self {
        let uploads = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.upload_directory = uploads.path().to_path_buf();
        configure(&mut config);
        let config = Arc::new(config);

        let store = Arc::new(MemoryStore::new());
        let stub = Arc::new(StubEngine::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = engine.unwrap_or_else(|| stub.clone() as Arc<dyn FaceEngine>);
        let pipeline = Pipeline::new(config.clone(), store.clone(), engine, sink.clone(), None);
        Self { pipeline, store, engine: stub, sink, config, _uploads: uploads }
    }

    pub async fn start() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let t = Self::build(configure, None);
        t.pipeline.start();
        t
    }

    pub async fn disabled() -> Self {
        let t = Self::build(
            |c| c.with_face_recognition = false,
            Some(Arc::new(DisabledEngine::new(Duration::ZERO))),
        );
        t.pipeline.start();
        t
    }

    /// Built without workers; call [`TestPipeline::resume`] to run queued jobs.
    pub async fn start_paused() -> Self {
        Self::build(|_| {}, None)
    }

    pub fn resume(&self) {
        self.pipeline.start();
    }
}

pub async fn add_directory(t: &TestPipeline, root: &Path) -> Directory {
    t.store
        .create_directory(NewDirectory {
            name: "Gala".to_string(),
            path: root.to_path_buf(),
            is_visible: true,
        })
        .await
        .unwrap()
}

pub async fn add_photo(t: &TestPipeline, directory: &Directory, name: &str, faces: Vec<FaceVector>) -> Photo {
    let current = t.store.get_directory(directory.id).await.unwrap().unwrap();
    t.store
        .create_photo(NewPhoto {
            directory_id: directory.id,
            generation: current.generation,
            path: current.path.join(name),
            face_encodings: faces,
        })
        .await
        .unwrap()
        .unwrap()
}

pub async fn waiting_demand(t: &TestPipeline, directory_id: i64, name: &str, encoding: FaceVector) -> Demand {
    let mut demand = t
        .store
        .create_demand(NewDemand {
            directory_id,
            name: name.to_string(),
            first_name: "Test".to_string(),
            email: format!("{}@example.org", name),
            upload: None,
        })
        .await
        .unwrap();
    demand.processing_status = ProcessingStatus::WaitingForSearch;
    demand.face_encoding = Some(encoding);
    t.store.update_demand(&demand).await.unwrap();
    demand
}
