//! Still-image enrollment: decode a photo and compute one encoding from it.

use crate::state::{EventSender, SharedProvider, WorkerEvent};
use sightline_core::{Embedding, ProviderError};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("Failed to load image: {0}")]
    ImageLoad(#[from] image::ImageError),
    #[error("Face recognition error: {0}")]
    Provider(#[from] ProviderError),
    #[error("No face found. Please choose another image.")]
    NoFace,
}

/// The single encoding taken from a still image.
#[derive(Debug, Clone)]
pub struct StillEncoding {
    pub embedding: Embedding,
    /// Faces the provider found; only the first one is kept.
    pub faces_found: usize,
}

/// Terminal result of one enrollment run, delivered exactly once.
#[derive(Debug)]
pub struct EnrollmentOutcome {
    pub path: PathBuf,
    pub result: Result<StillEncoding, EnrollError>,
}

/// Decode `path` at full resolution and encode the first detected face.
pub fn encode_still(path: &Path, provider: &SharedProvider) -> Result<StillEncoding, EnrollError> {
    let image = image::open(path)?.to_rgb8();
    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "enroll: image decoded"
    );

    let faces = provider.lock()?.detect_and_encode(&image)?;
    let faces_found = faces.len();
    let first = faces.into_iter().next().ok_or(EnrollError::NoFace)?;

    if faces_found > 1 {
        tracing::warn!(
            path = %path.display(),
            faces_found,
            "enroll: several faces in image; using the first"
        );
    }

    Ok(StillEncoding {
        embedding: first.embedding,
        faces_found,
    })
}

/// Run [`encode_still`] on a dedicated thread and post the outcome to
/// `events`.
pub fn spawn_enrollment(
    path: PathBuf,
    provider: SharedProvider,
    events: EventSender,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("sightline-enroll".into())
        .spawn(move || {
            let result = encode_still(&path, &provider);
            match &result {
                Ok(enc) => tracing::info!(
                    path = %path.display(),
                    dim = enc.embedding.dim(),
                    "enroll: encoding ready"
                ),
                Err(e) => tracing::info!(path = %path.display(), error = %e, "enroll: no encoding"),
            }
            if events
                .send(WorkerEvent::EnrollmentFinished(EnrollmentOutcome { path, result }))
                .is_err()
            {
                tracing::warn!("enroll: controller gone; outcome dropped");
            }
        })
}
