use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the JSON gallery record.
    pub gallery_path: PathBuf,
    /// Euclidean acceptance threshold. `None` defers to the embedding
    /// provider's recommendation.
    pub match_threshold: Option<f32>,
    /// Linear downsample factor applied before detection on video frames.
    pub downsample_factor: u32,
    /// Minimum time between streaming cycles; zero disables throttling.
    pub min_frame_interval: Duration,
    /// Where `CaptureSnapshot` writes the latest annotated frame.
    pub snapshot_path: PathBuf,
}

impl Config {
    /// Load configuration from `SIGHTLINE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("SIGHTLINE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| sightline_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("sightline");

        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("sightline");

        Self {
            camera_device: std::env::var("SIGHTLINE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            gallery_path: std::env::var("SIGHTLINE_GALLERY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("known_faces.json")),
            match_threshold: env_parse("SIGHTLINE_MATCH_THRESHOLD"),
            downsample_factor: env_parse("SIGHTLINE_DOWNSAMPLE_FACTOR")
                .filter(|&f: &u32| f >= 1)
                .unwrap_or(4),
            min_frame_interval: Duration::from_millis(
                env_parse("SIGHTLINE_MIN_FRAME_INTERVAL_MS").unwrap_or(0),
            ),
            snapshot_path: std::env::var("SIGHTLINE_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| runtime_dir.join("latest.png")),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
