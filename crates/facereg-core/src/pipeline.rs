//! Face detection and embedding primitives consumed by the recognizer.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Black-box face capability: find faces, then embed each one.
///
/// Implementations must be deterministic for identical pixels.
pub trait FacePipeline: Send + Sync {
    /// Detected faces, in detection order.
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, PipelineError>;

    /// Fixed-length embedding of one face returned by [`detect_faces`](Self::detect_faces).
    fn embed(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, PipelineError>;
}

/// SCRFD detection plus ArcFace embedding over ONNX Runtime.
///
/// Each session sits behind its own mutex; inference on one model does not
/// block the other, nor any store or cache lock.
pub struct OnnxPipeline {
    detector: Mutex<FaceDetector>,
    embedder: Mutex<FaceEmbedder>,
}

impl OnnxPipeline {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, PipelineError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let embedder = FaceEmbedder::load(&arcface.to_string_lossy())?;
        tracing::info!(model_dir = %model_dir.display(), "face pipeline ready");

        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
        })
    }
}

impl FacePipeline for OnnxPipeline {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, PipelineError> {
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(detector.detect(image)?)
    }

    fn embed(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, PipelineError> {
        let mut embedder = self.embedder.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(embedder.embed(image, face)?)
    }
}
