//! Streaming recognition worker.
//!
//! Each cycle: acquire a frame, downsample, detect and encode, classify each
//! face against the current gallery snapshot, draw annotations on the
//! full-resolution frame and publish it, replacing the previous one.

use crate::annotate::{draw_annotations, AnnotatedFrame, Annotation};
use crate::state::{EventSender, FrameSender, SharedGallery, SharedProvider, WorkerEvent};
use sightline_core::{EmbeddingProvider, EuclideanMatcher, Gallery, Matcher, ProviderError};
use sightline_hw::{frame, Frame, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Consecutive failed reads before the failure is surfaced as status text.
const PERSISTENT_READ_FAILURES: u32 = 30;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Lifecycle of the streaming pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Stopped => "stopped",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
        }
    }
}

/// Tunables for a streaming session.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub threshold: f32,
    pub downsample_factor: u32,
    pub min_frame_interval: Duration,
}

/// Everything the worker needs besides its frame source.
pub struct StreamContext {
    pub settings: StreamSettings,
    pub provider: SharedProvider,
    pub gallery: Arc<SharedGallery>,
    pub frames: Arc<FrameSender>,
    pub events: EventSender,
}

/// Handle to a running streaming worker.
pub struct StreamWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StreamWorker {
    /// Start the worker on its own thread. The worker owns `source` and
    /// drops it (releasing the device) when the loop exits.
    pub fn spawn(source: Box<dyn FrameSource>, ctx: StreamContext) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("sightline-stream".into())
            .spawn(move || run(source, ctx, &flag))?;
        Ok(Self { stop, handle })
    }

    /// Ask the loop to exit at the next cycle boundary and wait for it.
    ///
    /// May block for up to one frame-processing duration.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            tracing::error!("stream worker panicked");
        }
    }
}

fn run(mut source: Box<dyn FrameSource>, ctx: StreamContext, stop: &AtomicBool) {
    tracing::info!(
        factor = ctx.settings.downsample_factor,
        threshold = ctx.settings.threshold,
        "stream worker started"
    );

    let mut read_failures = 0u32;
    let mut provider_failing = false;

    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();

        let frame = match source.next_frame() {
            Ok(frame) => {
                read_failures = 0;
                frame
            }
            Err(e) => {
                read_failures += 1;
                tracing::debug!(error = %e, read_failures, "frame read failed; skipping cycle");
                if read_failures == PERSISTENT_READ_FAILURES {
                    let message = format!("Camera is not delivering frames: {e}");
                    let _ = ctx.events.send(WorkerEvent::StreamStatus(message));
                }
                std::thread::sleep(READ_RETRY_DELAY);
                continue;
            }
        };

        let gallery = ctx.gallery.snapshot();
        let result = ctx.provider.lock().and_then(|mut provider| {
            recognize_frame(frame, &mut **provider, &gallery, &ctx.settings)
        });

        match result {
            Ok(annotated) => {
                provider_failing = false;
                ctx.frames.send_replace(Some(Arc::new(annotated)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognition failed for frame");
                if !provider_failing {
                    provider_failing = true;
                    let message = format!("Face recognition error: {e}");
                    let _ = ctx.events.send(WorkerEvent::StreamStatus(message));
                }
            }
        }

        if let Some(rest) = ctx.settings.min_frame_interval.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    drop(source);
    tracing::info!("stream worker exiting; camera released");
}

/// Run one recognition pass over `frame` and return it annotated.
pub fn recognize_frame(
    frame: Frame,
    provider: &mut dyn EmbeddingProvider,
    gallery: &Gallery,
    settings: &StreamSettings,
) -> Result<AnnotatedFrame, ProviderError> {
    let factor = settings.downsample_factor.max(1);
    let small = frame::downsample(&frame.image, factor);
    let faces = provider.detect_and_encode(&small)?;

    let annotations: Vec<Annotation> = faces
        .into_iter()
        .map(|face| {
            let result = EuclideanMatcher.classify(&face.embedding, gallery, settings.threshold);
            Annotation {
                bbox: face.bbox.scaled(factor as f32),
                label: result.display_label().to_string(),
                matched: result.matched,
                distance: result.distance,
            }
        })
        .collect();

    let mut image = frame.image;
    draw_annotations(&mut image, &annotations);

    tracing::trace!(
        seq = frame.sequence,
        faces = annotations.len(),
        known = annotations.iter().filter(|a| a.matched).count(),
        "frame recognised"
    );

    Ok(AnnotatedFrame {
        image,
        annotations,
        sequence: frame.sequence,
    })
}
