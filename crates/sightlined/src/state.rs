//! State shared between the controller and its workers.

use crate::annotate::AnnotatedFrame;
use crate::enroll::EnrollmentOutcome;
use sightline_core::{EmbeddingProvider, Gallery, ProviderError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// The embedding provider, shared by the streaming and enrollment workers.
/// Calls are serialised; a long enrollment call delays streaming cycles.
#[derive(Clone)]
pub struct SharedProvider(Arc<Mutex<Box<dyn EmbeddingProvider>>>);

impl SharedProvider {
    pub fn new(provider: Box<dyn EmbeddingProvider>) -> Self {
        Self(Arc::new(Mutex::new(provider)))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Box<dyn EmbeddingProvider>>, ProviderError> {
        self.0
            .lock()
            .map_err(|_| ProviderError::Unavailable("provider lock poisoned".into()))
    }
}

/// Snapshot-on-read gallery.
///
/// Readers clone an `Arc` to the current gallery and keep a consistent view
/// for as long as they hold it. The controller publishes a whole new
/// gallery on every mutation.
#[derive(Default)]
pub struct SharedGallery {
    current: RwLock<Arc<Gallery>>,
}

impl SharedGallery {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            current: RwLock::new(Arc::new(gallery)),
        }
    }

    pub fn snapshot(&self) -> Arc<Gallery> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, gallery: Gallery) {
        let next = Arc::new(gallery);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Latest-frame-wins slot for the rendering layer.
pub type FrameSender = tokio::sync::watch::Sender<Option<Arc<AnnotatedFrame>>>;
pub type FrameReceiver = tokio::sync::watch::Receiver<Option<Arc<AnnotatedFrame>>>;

/// Messages from background workers to the controller.
pub enum WorkerEvent {
    /// Terminal outcome of an enrollment worker.
    EnrollmentFinished(EnrollmentOutcome),
    /// Status text from the streaming worker.
    StreamStatus(String),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<WorkerEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>;
