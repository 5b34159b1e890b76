//! sightline-core: Gallery, matching, and face embedding.
//!
//! Holds the gallery of known identities and its JSON record, the
//! nearest-neighbour matcher, and the embedding provider interface with an
//! ONNX implementation (SCRFD detection, ArcFace recognition).

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod onnx;
pub mod provider;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use gallery::{Gallery, GalleryEntry, GalleryStore, LoadStatus, StoreError};
pub use provider::{EmbeddingProvider, OnnxProvider, ProviderError};
pub use types::{
    BoundingBox, Embedding, EuclideanMatcher, FaceEncoding, MatchResult, Matcher,
    DEFAULT_MATCH_THRESHOLD, UNKNOWN_LABEL,
};

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/sightline/models")
}
