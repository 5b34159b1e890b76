use crate::controller::Controller;
use crate::state::FrameReceiver;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.sightline.Recognizer1";
pub const OBJECT_PATH: &str = "/org/sightline/Recognizer1";

/// D-Bus interface for the Sightline recognition daemon.
///
/// Bus name: org.sightline.Recognizer1
/// Object path: /org/sightline/Recognizer1
pub struct RecognizerService {
    controller: Arc<Mutex<Controller>>,
    frames: FrameReceiver,
    snapshot_path: PathBuf,
}

impl RecognizerService {
    pub fn new(controller: Arc<Mutex<Controller>>, snapshot_path: PathBuf) -> Self {
        let frames = match controller.lock() {
            Ok(c) => c.subscribe_frames(),
            Err(poisoned) => poisoned.into_inner().subscribe_frames(),
        };
        Self {
            controller,
            frames,
            snapshot_path,
        }
    }

    /// Run `f` against the controller on the blocking pool. Controller
    /// operations may join worker threads.
    async fn with_controller<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&mut Controller) -> T + Send + 'static,
        T: Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || match controller.lock() {
            Ok(mut guard) => Ok(f(&mut guard)),
            Err(_) => Err(zbus::fdo::Error::Failed("controller lock poisoned".into())),
        })
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("controller task failed: {e}")))?
    }

    /// Broadcast `message` and hand it back as the method reply.
    async fn announce(emitter: &SignalEmitter<'_>, message: String) -> zbus::fdo::Result<String> {
        emit_status(emitter, &message).await;
        Ok(message)
    }
}

/// Emit `StatusChanged`; failures are logged, never returned.
pub async fn emit_status(emitter: &SignalEmitter<'_>, message: &str) {
    if let Err(e) = RecognizerService::status_changed(emitter, message).await {
        tracing::warn!(error = %e, "failed to emit StatusChanged");
    }
}

#[interface(name = "org.sightline.Recognizer1")]
impl RecognizerService {
    /// Reload the gallery from its durable record.
    async fn load_known_faces(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        let message = self.with_controller(|c| c.load_known_faces()).await?;
        Self::announce(&emitter, message).await
    }

    async fn save_known_faces(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        let message = self.with_controller(|c| c.save_known_faces()).await?;
        Self::announce(&emitter, message).await
    }

    /// Start the camera if stopped, stop it if running.
    async fn toggle_camera(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        let message = self.with_controller(|c| c.toggle_camera()).await?;
        Self::announce(&emitter, message).await
    }

    /// Enroll the face in the image at `path`. The final outcome arrives
    /// as a `StatusChanged` signal.
    async fn upload_image(
        &self,
        path: &str,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(path, "upload_image requested");
        let path = PathBuf::from(path);
        let message = self.with_controller(move |c| c.upload_image(&path)).await?;
        Self::announce(&emitter, message).await
    }

    async fn delete_face(
        &self,
        index: u32,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(index, "delete_face requested");
        let message = self
            .with_controller(move |c| c.delete_entry(index as usize))
            .await?;
        Self::announce(&emitter, message).await
    }

    /// Known faces as a JSON array of `{index, label}`.
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        let faces = self.with_controller(|c| c.list_faces()).await?;
        let json: Vec<_> = faces
            .into_iter()
            .map(|(index, label)| serde_json::json!({ "index": index, "label": label }))
            .collect();
        Ok(serde_json::Value::from(json).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.with_controller(|c| c.status_json()).await?;
        Ok(status.to_string())
    }

    /// Write the latest annotated frame to the snapshot path.
    async fn capture_snapshot(&self) -> zbus::fdo::Result<String> {
        let Some(frame) = self.frames.borrow().clone() else {
            return Err(zbus::fdo::Error::Failed(
                "no annotated frame available; is the camera running?".into(),
            ));
        };
        let path = self.snapshot_path.clone();

        let written = path.clone();
        let saved = tokio::task::spawn_blocking(move || {
            write_snapshot(&written, &frame.image).map(|()| frame)
        })
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("snapshot task failed: {e}")))?;
        let frame = saved.map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "snapshot write failed");
            zbus::fdo::Error::Failed(format!("failed to write snapshot: {e}"))
        })?;

        tracing::info!(path = %path.display(), seq = frame.sequence, "snapshot written");
        Ok(serde_json::json!({
            "path": path.display().to_string(),
            "sequence": frame.sequence,
            "annotations": frame.annotations,
        })
        .to_string())
    }

    /// Status text for the rendering layer: camera changes, enrollment
    /// outcomes, worker failures.
    #[zbus(signal)]
    async fn status_changed(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;
}

fn write_snapshot(path: &Path, image: &image::RgbImage) -> Result<(), image::ImageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(image::ImageError::IoError)?;
    }
    image.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_write_snapshot_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/sightline/latest.png");
        let image = RgbImage::from_pixel(4, 3, Rgb([0, 255, 0]));

        write_snapshot(&path, &image).unwrap();

        let back = image::open(&path).unwrap().to_rgb8();
        assert_eq!(back, image);
    }
}
