//! Embedding provider: image in, detected faces with embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MATCH_THRESHOLD};
use crate::types::{FaceEncoding, DEFAULT_MATCH_THRESHOLD};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
}

/// Detects faces in an image and computes one embedding per face.
///
/// Zero results is a valid answer. Calls are expensive and not
/// cancellable; callers decide on which thread to make them.
pub trait EmbeddingProvider: Send {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<FaceEncoding>, ProviderError>;

    /// Recommended Euclidean acceptance threshold for this provider's embeddings.
    fn match_threshold(&self) -> f32 {
        DEFAULT_MATCH_THRESHOLD
    }
}

/// SCRFD detection followed by ArcFace embedding, both via ONNX Runtime.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    pub const DETECTOR_MODEL: &'static str = "det_10g.onnx";
    pub const RECOGNIZER_MODEL: &'static str = "w600k_r50.onnx";

    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&model_dir.join(Self::DETECTOR_MODEL))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(Self::RECOGNIZER_MODEL))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<FaceEncoding>, ProviderError> {
        let faces = self.detector.detect(image)?;
        let mut encodings = Vec::with_capacity(faces.len());

        for face in faces {
            if face.landmarks.is_none() {
                tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                continue;
            }
            let embedding = self.recognizer.extract(image, &face)?;
            encodings.push(FaceEncoding {
                bbox: face,
                embedding,
            });
        }

        Ok(encodings)
    }

    fn match_threshold(&self) -> f32 {
        ARCFACE_MATCH_THRESHOLD
    }
}
