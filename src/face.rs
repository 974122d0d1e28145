use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::FaceVector;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Length of the vectors produced by the external encoder.
pub const ENCODING_LEN: usize = 128;

/// Face detection, encoding and comparison.
///
/// Implementations are blocking; async callers go through `spawn_blocking`.
pub trait FaceEngine: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Every face found in the image, in detection order. Empty when none is found.
    fn detect_and_encode(&self, image: &Path) -> Result<Vec<FaceVector>, AppError>;

    /// One boolean per candidate, true iff its distance to `query` is within `tolerance`.
    fn compare(&self, candidates: &[FaceVector], query: &FaceVector, tolerance: f64) -> Vec<bool> {
        compare_faces(candidates, query, tolerance)
    }
}

pub fn face_distance(a: &FaceVector, b: &FaceVector) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

pub fn compare_faces(candidates: &[FaceVector], query: &FaceVector, tolerance: f64) -> Vec<bool> {
    candidates
        .par_iter()
        .map(|candidate| candidate.len() == query.len() && face_distance(candidate, query) <= tolerance)
        .collect()
}

pub fn file_hash(path: &Path) -> Result<String, AppError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reads vectors precomputed by the external encoder, stored as
/// `<encodings_directory>/<sha256 of image>.json`.
pub struct EncodingsEngine {
    encodings_directory: PathBuf,
}

impl EncodingsEngine {
    pub fn new(encodings_directory: impl Into<PathBuf>) -> Self {
        Self { encodings_directory: encodings_directory.into() }
    }
}

impl FaceEngine for EncodingsEngine {
    fn detect_and_encode(&self, image: &Path) -> Result<Vec<FaceVector>, AppError> {
        log::trace!("Checking image header for {:?}", image);
        image::image_dimensions(image)?;

        let hash = file_hash(image)?;
        let encodings_path = self.encodings_directory.join(format!("{}.json", hash));
        match std::fs::read(&encodings_path) {
            Ok(bytes) => {
                let faces: Vec<FaceVector> = serde_json::from_slice(&bytes)?;
                log::debug!("Found {} faces for {:?}", faces.len(), image);
                Ok(faces)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No encodings recorded for {:?} ({})", image, hash);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Stands in when face recognition is switched off: detects nothing after a
/// simulated delay and never reports a match.
pub struct DisabledEngine {
    delay: Duration,
}

impl DisabledEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Deterministic vector given to demands while the capability is off.
    pub fn placeholder_encoding() -> FaceVector {
        vec![0.0; ENCODING_LEN]
    }
}

impl FaceEngine for DisabledEngine {
    fn is_enabled(&self) -> bool {
        false
    }

    fn detect_and_encode(&self, image: &Path) -> Result<Vec<FaceVector>, AppError> {
        log::trace!("Face recognition disabled, simulating encode of {:?}", image);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(Vec::new())
    }

    fn compare(&self, candidates: &[FaceVector], _query: &FaceVector, _tolerance: f64) -> Vec<bool> {
        vec![false; candidates.len()]
    }
}

pub fn create_face_engine(config: &AppConfig) -> Arc<dyn FaceEngine> {
    if config.with_face_recognition {
        log::info!("Face recognition enabled, encodings read from {:?}", config.encodings_directory);
        Arc::new(EncodingsEngine::new(&config.encodings_directory))
    } else {
        log::warn!("Face recognition disabled, indexing and searches will find no faces");
        Arc::new(DisabledEngine::new(Duration::from_millis(config.simulated_encode_delay_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_uses_euclidean_tolerance() {
        let candidates = vec![vec![0.0, 0.0], vec![0.3, 0.4], vec![3.0, 4.0], vec![0.0]];
        let query = vec![0.0, 0.0];
        assert_eq!(
            compare_faces(&candidates, &query, 0.5),
            vec![true, true, false, false]
        );
        assert!((face_distance(&candidates[2], &query) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_engine_finds_nothing_and_matches_nothing() {
        let engine = DisabledEngine::new(Duration::ZERO);
        assert!(!engine.is_enabled());
        assert!(engine.detect_and_encode(Path::new("/nowhere.jpg")).unwrap().is_empty());
        let query = DisabledEngine::placeholder_encoding();
        assert_eq!(engine.compare(&[query.clone(), query.clone()], &query, 1.0), vec![false, false]);
    }

    #[test]
    fn encodings_engine_reads_vectors_by_image_hash() {
        let images = tempfile::tempdir().unwrap();
        let encodings = tempfile::tempdir().unwrap();
        let with_face = images.path().join("face.png");
        let without = images.path().join("empty.png");
        image::RgbImage::new(4, 4).save(&with_face).unwrap();
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0])).save(&without).unwrap();

        let hash = file_hash(&with_face).unwrap();
        std::fs::write(
            encodings.path().join(format!("{}.json", hash)),
            serde_json::to_vec(&vec![vec![0.5; 4], vec![0.1; 4]]).unwrap(),
        )
        .unwrap();

        let engine = EncodingsEngine::new(encodings.path());
        assert_eq!(engine.detect_and_encode(&with_face).unwrap().len(), 2);
        assert!(engine.detect_and_encode(&without).unwrap().is_empty());
    }

    #[test]
    fn encodings_engine_rejects_unreadable_images() {
        let images = tempfile::tempdir().unwrap();
        let bogus = images.path().join("notes.jpg");
        std::fs::write(&bogus, b"not an image").unwrap();
        let engine = EncodingsEngine::new(images.path());
        assert!(engine.detect_and_encode(&bogus).is_err());
    }
}
