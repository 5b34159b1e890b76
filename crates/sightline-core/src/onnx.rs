//! ONNX Runtime session setup shared by the detector and the recognizer.

use ort::session::Session;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INTRA_OP_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file {0} is missing; place the insightface buffalo_l models in the model directory")]
    Missing(PathBuf),
    #[error("onnx runtime: {0}")]
    Runtime(#[from] ort::Error),
}

/// Open `path` as an inference session.
pub(crate) fn open_session(path: &Path) -> Result<Session, ModelError> {
    if !path.is_file() {
        return Err(ModelError::Missing(path.to_path_buf()));
    }

    let session = Session::builder()?
        .with_intra_threads(INTRA_OP_THREADS)?
        .commit_from_file(path)?;

    tracing::debug!(
        path = %path.display(),
        inputs = session.inputs().len(),
        outputs = session.outputs().len(),
        "onnx session ready"
    );
    Ok(session)
}
