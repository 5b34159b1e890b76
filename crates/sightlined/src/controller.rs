//! Pipeline controller.
//!
//! Owns the gallery and both worker handles. Every operation returns a
//! human-readable status string; nothing here propagates an error to the
//! caller.

use crate::enroll::{spawn_enrollment, EnrollmentOutcome};
use crate::state::{
    EventReceiver, EventSender, FrameReceiver, FrameSender, SharedGallery, SharedProvider,
    WorkerEvent,
};
use crate::stream::{StreamContext, StreamSettings, StreamState, StreamWorker};
use sightline_core::{
    EmbeddingProvider, EuclideanMatcher, Gallery, GalleryEntry, GalleryStore, Matcher,
};
use sightline_hw::{Camera, CameraError, FrameSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Opens the frame source for a new camera session.
pub trait CameraOpener: Send {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Opens a V4L2 device by path.
pub struct V4lCameraOpener {
    device: String,
}

impl V4lCameraOpener {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl CameraOpener for V4lCameraOpener {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.device)?;
        tracing::info!(camera = %camera.describe(), "camera opened");
        Ok(Box::new(camera))
    }
}

struct EnrollmentJob {
    path: PathBuf,
    handle: JoinHandle<()>,
}

pub struct Controller {
    store: GalleryStore,
    gallery: Arc<SharedGallery>,
    provider: SharedProvider,
    camera: Box<dyn CameraOpener>,
    settings: StreamSettings,
    state: StreamState,
    stream: Option<StreamWorker>,
    enrollment: Option<EnrollmentJob>,
    frames: Arc<FrameSender>,
    events: EventSender,
    last_status: String,
}

impl Controller {
    /// Build a controller with an empty gallery and a stopped camera.
    ///
    /// The returned receiver carries worker events; feed each one back
    /// through [`Controller::handle_event`].
    pub fn new(
        store: GalleryStore,
        provider: Box<dyn EmbeddingProvider>,
        camera: Box<dyn CameraOpener>,
        settings: StreamSettings,
    ) -> (Self, EventReceiver) {
        let (frames, _) = tokio::sync::watch::channel(None);
        let (events, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let controller = Self {
            store,
            gallery: Arc::new(SharedGallery::default()),
            provider: SharedProvider::new(provider),
            camera,
            settings,
            state: StreamState::Stopped,
            stream: None,
            enrollment: None,
            frames: Arc::new(frames),
            events,
            last_status: String::new(),
        };
        (controller, events_rx)
    }

    pub fn subscribe_frames(&self) -> FrameReceiver {
        self.frames.subscribe()
    }

    pub fn gallery(&self) -> Arc<Gallery> {
        self.gallery.snapshot()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn report(&mut self, message: impl Into<String>) -> String {
        let message = message.into();
        tracing::info!(status = %message, "status");
        self.last_status.clone_from(&message);
        message
    }

    // ---- gallery persistence ----

    /// Replace the in-memory gallery with the durable record.
    pub fn load_known_faces(&mut self) -> String {
        let (gallery, status) = self.store.load();
        if status.is_error() {
            tracing::warn!(
                path = %self.store.path().display(),
                %status,
                "gallery load failed; starting empty"
            );
        }
        self.gallery.replace(gallery);
        self.report(status.to_string())
    }

    pub fn save_known_faces(&mut self) -> String {
        let gallery = self.gallery.snapshot();
        match self.store.save(&gallery) {
            Ok(()) => self.report(format!("Saved {} known faces.", gallery.len())),
            Err(e) => self.report(format!("Error saving face data: {e}")),
        }
    }

    /// Persist `next` and publish it to readers. The in-memory gallery is
    /// updated even if the write fails.
    fn commit(&mut self, next: Gallery) -> Result<(), sightline_core::StoreError> {
        let saved = self.store.save(&next);
        self.gallery.replace(next);
        saved
    }

    // ---- camera lifecycle ----

    pub fn start_camera(&mut self) -> String {
        if self.stream.is_some() {
            return self.report("Camera is already running.");
        }

        self.state = StreamState::Starting;
        let source = match self.camera.open() {
            Ok(source) => source,
            Err(e) => {
                self.state = StreamState::Stopped;
                return self.report(format!("Failed to open camera: {e}"));
            }
        };

        let ctx = StreamContext {
            settings: self.settings,
            provider: self.provider.clone(),
            gallery: Arc::clone(&self.gallery),
            frames: Arc::clone(&self.frames),
            events: self.events.clone(),
        };
        match StreamWorker::spawn(source, ctx) {
            Ok(worker) => {
                self.stream = Some(worker);
                self.state = StreamState::Running;
                self.report("Camera started.")
            }
            Err(e) => {
                self.state = StreamState::Stopped;
                self.report(format!("Failed to start recognition worker: {e}"))
            }
        }
    }

    /// Stop streaming and wait until the camera is released. Calling this
    /// while stopped is a no-op.
    pub fn stop_camera(&mut self) -> String {
        let Some(worker) = self.stream.take() else {
            return self.report("Camera is not running.");
        };
        self.state = StreamState::Stopping;
        worker.stop();
        self.frames.send_replace(None);
        self.state = StreamState::Stopped;
        self.report("Camera stopped.")
    }

    pub fn toggle_camera(&mut self) -> String {
        if self.stream.is_some() {
            self.stop_camera()
        } else {
            self.start_camera()
        }
    }

    // ---- enrollment ----

    /// Start encoding `path` on the enrollment worker. The outcome arrives
    /// later as a [`WorkerEvent::EnrollmentFinished`].
    pub fn enroll_from_file(&mut self, path: &Path) -> String {
        if path.as_os_str().is_empty() {
            return self.report("No file selected, please try again.");
        }
        if let Some(job) = &self.enrollment {
            let busy = format!(
                "Still processing {}; please wait before uploading another image.",
                job.path.display()
            );
            return self.report(busy);
        }

        match spawn_enrollment(path.to_path_buf(), self.provider.clone(), self.events.clone()) {
            Ok(handle) => {
                self.enrollment = Some(EnrollmentJob {
                    path: path.to_path_buf(),
                    handle,
                });
                self.report(format!("Processing {}...", path.display()))
            }
            Err(e) => self.report(format!("Failed to start enrollment: {e}")),
        }
    }

    /// Stop the camera if it is running, then enroll `path`. A rejected
    /// upload leaves the camera as it was.
    pub fn upload_image(&mut self, path: &Path) -> String {
        let accepted = !path.as_os_str().is_empty() && self.enrollment.is_none();
        if accepted && self.stream.is_some() {
            self.stop_camera();
        }
        self.enroll_from_file(path)
    }

    pub fn handle_event(&mut self, event: WorkerEvent) -> String {
        match event {
            WorkerEvent::EnrollmentFinished(outcome) => self.complete_enrollment(outcome),
            WorkerEvent::StreamStatus(message) => self.report(message),
        }
    }

    /// Duplicate-check the new encoding and append it under the next label.
    fn complete_enrollment(&mut self, outcome: EnrollmentOutcome) -> String {
        if let Some(job) = self.enrollment.take() {
            if job.handle.join().is_err() {
                tracing::error!(path = %job.path.display(), "enrollment worker panicked");
            }
        }

        let encoding = match outcome.result {
            Ok(encoding) => encoding,
            Err(e) => return self.report(e.to_string()),
        };
        if !encoding.embedding.is_finite() {
            return self.report("Face encoding contains invalid values; not added.");
        }

        let current = self.gallery.snapshot();
        if let Some(dim) = current.get(0).map(|e| e.embedding.dim()) {
            if dim != encoding.embedding.dim() {
                return self.report(format!(
                    "Embedding has {} values but known faces have {dim}; not added.",
                    encoding.embedding.dim()
                ));
            }
        }

        if EuclideanMatcher.is_duplicate(&encoding.embedding, &current, self.settings.threshold) {
            return self.report("This face already exists in the known faces.");
        }

        let mut next = (*current).clone();
        let label = next.next_label();
        next.push(GalleryEntry::new(label.clone(), encoding.embedding));

        let mut message = match self.commit(next) {
            Ok(()) => format!("Image loaded successfully. Added {label}."),
            Err(e) => format!("Added {label}, but saving face data failed: {e}"),
        };
        if encoding.faces_found > 1 {
            message.push_str(&format!(
                " Only the first of {} faces was used.",
                encoding.faces_found
            ));
        }
        self.report(message)
    }

    // ---- deletion and queries ----

    /// Remove the entry at `index`; later entries shift down by one.
    pub fn delete_entry(&mut self, index: usize) -> String {
        let mut next = (*self.gallery.snapshot()).clone();
        let Some(removed) = next.remove(index) else {
            let len = next.len();
            return self.report(format!(
                "No face at index {index} ({len} known faces); nothing deleted."
            ));
        };

        match self.commit(next) {
            Ok(()) => self.report(format!("Deleted face: {}", removed.label)),
            Err(e) => self.report(format!(
                "Deleted face: {}, but saving face data failed: {e}",
                removed.label
            )),
        }
    }

    pub fn list_faces(&self) -> Vec<(usize, String)> {
        self.gallery()
            .labels()
            .enumerate()
            .map(|(i, label)| (i, label.to_string()))
            .collect()
    }

    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.state().as_str(),
            "known_faces": self.gallery.snapshot().len(),
            "enrolling": self.enrollment.as_ref().map(|job| job.path.display().to_string()),
            "threshold": self.settings.threshold,
            "downsample_factor": self.settings.downsample_factor,
            "gallery_path": self.store.path().display().to_string(),
            "last_status": self.last_status,
        })
    }

    /// Stop the camera and wait for any in-flight enrollment.
    pub fn shutdown(&mut self) {
        if self.stream.is_some() {
            self.stop_camera();
        }
        if let Some(job) = self.enrollment.take() {
            tracing::info!(path = %job.path.display(), "waiting for enrollment to finish");
            if job.handle.join().is_err() {
                tracing::error!("enrollment worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enroll::StillEncoding;
    use crate::stream::recognize_frame;
    use crate::stream::tests::BlankSource;
    use image::{Rgb, RgbImage};
    use sightline_core::{BoundingBox, Embedding, FaceEncoding, ProviderError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Reads the top-left pixel: red is the face count, green and blue
    /// (divided by 10) form the embedding.
    struct PixelProvider;

    impl EmbeddingProvider for PixelProvider {
        fn detect_and_encode(
            &mut self,
            image: &RgbImage,
        ) -> Result<Vec<FaceEncoding>, ProviderError> {
            let Rgb([count, g, b]) = *image.get_pixel(0, 0);
            let face = FaceEncoding {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 4.0,
                    height: 4.0,
                    confidence: 0.9,
                    landmarks: None,
                },
                embedding: Embedding::new(vec![g as f32 / 10.0, b as f32 / 10.0]),
            };
            Ok(vec![face; count as usize])
        }
    }

    struct FakeOpener {
        opens: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        fail: bool,
    }

    impl CameraOpener for FakeOpener {
        fn open(&mut self) -> Result<Box<dyn FrameSource>, CameraError> {
            if self.fail {
                return Err(CameraError::NotFound("/dev/video9".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.released.store(false, Ordering::SeqCst);
            Ok(Box::new(BlankSource {
                seq: 0,
                fail_every: None,
                released: Arc::clone(&self.released),
            }))
        }
    }

    struct Harness {
        controller: Controller,
        events: EventReceiver,
        opens: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        dir: tempfile::TempDir,
    }

    fn harness_with(fail_open: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(true));
        let (controller, events) = Controller::new(
            GalleryStore::new(dir.path().join("known_faces.json")),
            Box::new(PixelProvider),
            Box::new(FakeOpener {
                opens: Arc::clone(&opens),
                released: Arc::clone(&released),
                fail: fail_open,
            }),
            StreamSettings {
                threshold: 0.6,
                downsample_factor: 4,
                min_frame_interval: Duration::ZERO,
            },
        );
        Harness {
            controller,
            events,
            opens,
            released,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    impl Harness {
        fn image(&self, name: &str, pixel: [u8; 3]) -> PathBuf {
            let path = self.dir.path().join(name);
            RgbImage::from_pixel(16, 16, Rgb(pixel)).save(&path).unwrap();
            path
        }

        /// Enroll `path` and apply the worker's outcome.
        fn enroll(&mut self, path: &Path) -> String {
            let started = self.controller.enroll_from_file(path);
            assert!(started.starts_with("Processing"), "{started}");
            let event = self.events.blocking_recv().unwrap();
            self.controller.handle_event(event)
        }

        fn labels(&self) -> Vec<String> {
            self.controller.list_faces().into_iter().map(|(_, l)| l).collect()
        }
    }

    #[test]
    fn test_load_missing_record() {
        let mut h = harness();
        let msg = h.controller.load_known_faces();
        assert_eq!(msg, "No face data found. Please upload a photo.");
        assert!(h.controller.gallery().is_empty());
    }

    #[test]
    fn test_enroll_then_recognize() {
        let mut h = harness();
        let path = h.image("alice.png", [1, 10, 10]);

        let msg = h.enroll(&path);
        assert!(msg.starts_with("Image loaded successfully"), "{msg}");
        assert_eq!(h.labels(), vec!["Known (1)"]);

        // Persisted before the call returned
        let (on_disk, _) = GalleryStore::new(h.dir.path().join("known_faces.json")).load();
        assert_eq!(on_disk, *h.controller.gallery());

        let frame = sightline_hw::Frame::new(RgbImage::from_pixel(64, 48, Rgb([1, 12, 10])), 1);
        let mut provider = PixelProvider;
        let out = recognize_frame(
            frame,
            &mut provider,
            &h.controller.gallery(),
            &h.controller.settings,
        )
        .unwrap();
        assert_eq!(out.annotations.len(), 1);
        assert_eq!(out.annotations[0].label, "Known (1)");
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut h = harness();
        h.enroll(&h.image("a.png", [1, 10, 10]));

        let msg = h.enroll(&h.image("a-again.png", [1, 11, 10]));
        assert_eq!(msg, "This face already exists in the known faces.");
        assert_eq!(h.controller.gallery().len(), 1);
    }

    #[test]
    fn test_no_face_leaves_gallery() {
        let mut h = harness();
        let msg = h.enroll(&h.image("wall.png", [0, 0, 0]));
        assert_eq!(msg, "No face found. Please choose another image.");
        assert!(h.controller.gallery().is_empty());
        assert!(!h.dir.path().join("known_faces.json").exists());
    }

    #[test]
    fn test_multi_face_uses_first() {
        let mut h = harness();
        let msg = h.enroll(&h.image("group.png", [3, 50, 50]));
        assert!(msg.contains("Only the first of 3 faces"), "{msg}");
        assert_eq!(h.controller.gallery().len(), 1);
    }

    #[test]
    fn test_no_file_selected() {
        let mut h = harness();
        let msg = h.controller.upload_image(Path::new(""));
        assert_eq!(msg, "No file selected, please try again.");
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_enrollment_rejected() {
        let mut h = harness();
        let first = h.image("one.png", [1, 10, 10]);
        let second = h.image("two.png", [1, 90, 90]);

        assert!(h.controller.enroll_from_file(&first).starts_with("Processing"));
        let busy = h.controller.enroll_from_file(&second);
        assert!(busy.starts_with("Still processing"), "{busy}");

        let event = h.events.blocking_recv().unwrap();
        h.controller.handle_event(event);
        assert_eq!(h.controller.gallery().len(), 1);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_deletion_invariant() {
        let mut h = harness();
        for (i, g) in [0u8, 20, 40, 60].into_iter().enumerate() {
            h.enroll(&h.image(&format!("{i}.png"), [1, g, 0]));
        }
        let before = h.controller.gallery();
        assert_eq!(before.len(), 4);

        let msg = h.controller.delete_entry(1);
        assert_eq!(msg, "Deleted face: Known (2)");

        let after = h.controller.gallery();
        assert_eq!(after.len(), 3);
        assert_eq!(after[0], before[0]);
        for j in 1..after.len() {
            assert_eq!(after[j], before[j + 1]);
        }

        let (on_disk, _) = GalleryStore::new(h.dir.path().join("known_faces.json")).load();
        assert_eq!(on_disk, *after);

        // Next label counts from the current length
        h.enroll(&h.image("new.png", [1, 200, 0]));
        assert_eq!(h.labels().last().map(String::as_str), Some("Known (4)"));
    }

    #[test]
    fn test_invalid_delete_is_noop() {
        let mut h = harness();
        h.enroll(&h.image("a.png", [1, 10, 10]));
        let msg = h.controller.delete_entry(5);
        assert!(msg.contains("nothing deleted"), "{msg}");
        assert_eq!(h.controller.gallery().len(), 1);
    }

    #[test]
    fn test_camera_stop_and_restart() {
        let mut h = harness();
        assert_eq!(h.controller.stop_camera(), "Camera is not running.");

        assert_eq!(h.controller.toggle_camera(), "Camera started.");
        assert_eq!(h.controller.state(), StreamState::Running);
        assert!(!h.released.load(Ordering::SeqCst));

        let mut frames = h.controller.subscribe_frames();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.borrow_and_update().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(frames.borrow().is_some());

        assert_eq!(h.controller.toggle_camera(), "Camera stopped.");
        assert_eq!(h.controller.state(), StreamState::Stopped);
        assert!(h.released.load(Ordering::SeqCst));
        assert!(frames.borrow().is_none());
        assert_eq!(h.controller.stop_camera(), "Camera is not running.");

        assert_eq!(h.controller.start_camera(), "Camera started.");
        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
        h.controller.shutdown();
        assert!(h.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_camera_open_failure() {
        let mut h = harness_with(true);
        let msg = h.controller.start_camera();
        assert!(msg.starts_with("Failed to open camera"), "{msg}");
        assert_eq!(h.controller.state(), StreamState::Stopped);
    }

    #[test]
    fn test_upload_stops_camera() {
        let mut h = harness();
        h.controller.start_camera();
        let path = h.image("a.png", [1, 10, 10]);

        let msg = h.controller.upload_image(&path);
        assert!(msg.starts_with("Processing"), "{msg}");
        assert_eq!(h.controller.state(), StreamState::Stopped);
        assert!(h.released.load(Ordering::SeqCst));

        let event = h.events.blocking_recv().unwrap();
        assert!(h.controller.handle_event(event).starts_with("Image loaded"));
    }

    #[test]
    fn test_rejected_upload_keeps_camera() {
        let mut h = harness();
        let first = h.image("one.png", [1, 10, 10]);
        let second = h.image("two.png", [1, 90, 90]);

        assert!(h.controller.enroll_from_file(&first).starts_with("Processing"));
        assert_eq!(h.controller.start_camera(), "Camera started.");

        let msg = h.controller.upload_image(&second);
        assert!(msg.starts_with("Still processing"), "{msg}");
        assert_eq!(h.controller.state(), StreamState::Running);
        assert!(!h.released.load(Ordering::SeqCst));
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        let event = h.events.blocking_recv().unwrap();
        h.controller.handle_event(event);
        h.controller.shutdown();
        assert!(h.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_non_finite_encoding_not_added() {
        let mut h = harness();
        h.enroll(&h.image("a.png", [1, 10, 10]));

        let msg = h.controller.handle_event(WorkerEvent::EnrollmentFinished(EnrollmentOutcome {
            path: h.dir.path().join("b.png"),
            result: Ok(StillEncoding {
                embedding: Embedding::new(vec![f32::NAN, 1.0]),
                faces_found: 1,
            }),
        }));
        assert_eq!(msg, "Face encoding contains invalid values; not added.");
        assert_eq!(h.labels(), vec!["Known (1)"]);

        let (on_disk, status) = GalleryStore::new(h.dir.path().join("known_faces.json")).load();
        assert!(!status.is_error(), "{status}");
        assert_eq!(on_disk, *h.controller.gallery());
    }

    #[test]
    fn test_status_json() {
        let mut h = harness();
        h.controller.load_known_faces();
        let status = h.controller.status_json();
        assert_eq!(status["camera"], "stopped");
        assert_eq!(status["known_faces"], 0);
        assert!(status["enrolling"].is_null());
    }
}
