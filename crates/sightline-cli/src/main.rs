use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sightline_hw::{Camera, FrameSource};
use std::path::PathBuf;

// `#[zbus::proxy]` generates `RecognizerProxy` (async) and
// `RecognizerProxyBlocking`; the CLI uses the async one.
#[zbus::proxy(
    interface = "org.sightline.Recognizer1",
    default_service = "org.sightline.Recognizer1",
    default_path = "/org/sightline/Recognizer1"
)]
trait Recognizer {
    async fn load_known_faces(&self) -> zbus::Result<String>;
    async fn save_known_faces(&self) -> zbus::Result<String>;
    async fn toggle_camera(&self) -> zbus::Result<String>;
    async fn upload_image(&self, path: &str) -> zbus::Result<String>;
    async fn delete_face(&self, index: u32) -> zbus::Result<String>;
    async fn list_faces(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn capture_snapshot(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn status_changed(&self, message: &str) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "sightline", about = "Sightline face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List known faces
    List,
    /// Add the face in an image to the known faces
    Enroll {
        /// Image containing exactly one face (only the first is used)
        path: PathBuf,
    },
    /// Delete a known face by index
    Delete {
        /// Index as shown by `sightline list`
        index: u32,
    },
    /// Start or stop live recognition
    Camera,
    /// Reload known faces from disk
    Load,
    /// Write known faces to disk
    Save,
    /// Save the latest annotated frame as PNG
    Snapshot,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Device to capture from
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured frame
        #[arg(short, long, default_value = "sightline-test.png")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, output } => camera_test(&device, &output),
        command => daemon_command(command).await,
    }
}

async fn daemon_command(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = RecognizerProxy::new(&conn)
        .await
        .context("sightlined is not reachable; is the daemon running?")?;

    match command {
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List => {
            let faces: Vec<serde_json::Value> = serde_json::from_str(&proxy.list_faces().await?)?;
            if faces.is_empty() {
                println!("No known faces");
            }
            for face in faces {
                println!("{:>4}  {}", face["index"], face["label"].as_str().unwrap_or("?"));
            }
        }
        Commands::Enroll { path } => {
            let path = path
                .canonicalize()
                .with_context(|| format!("cannot resolve {}", path.display()))?;
            enroll(&proxy, &path).await?;
        }
        Commands::Delete { index } => println!("{}", proxy.delete_face(index).await?),
        Commands::Camera => println!("{}", proxy.toggle_camera().await?),
        Commands::Load => println!("{}", proxy.load_known_faces().await?),
        Commands::Save => println!("{}", proxy.save_known_faces().await?),
        Commands::Snapshot => {
            let reply: serde_json::Value = serde_json::from_str(&proxy.capture_snapshot().await?)?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Test { .. } => {
            anyhow::bail!("`test` opens the camera directly, not via the daemon")
        }
    }

    Ok(())
}

/// Upload `path` and wait for the enrollment outcome signal.
async fn enroll(proxy: &RecognizerProxy<'_>, path: &std::path::Path) -> Result<()> {
    use futures::StreamExt;

    // Subscribe before the call so the outcome cannot be missed.
    let mut updates = proxy.receive_status_changed().await?;
    let path_str = path
        .to_str()
        .context("image path is not valid UTF-8")?;
    let started = proxy.upload_image(path_str).await?;
    println!("{started}");
    if !started.starts_with("Processing") {
        return Ok(());
    }

    let outcome = tokio::time::timeout(std::time::Duration::from_secs(60), async {
        while let Some(signal) = updates.next().await {
            let message = signal.args()?.message().to_string();
            // Echoes of our own call precede the outcome.
            if message != started && !message.starts_with("Camera") {
                return Ok::<_, anyhow::Error>(Some(message));
            }
        }
        Ok::<_, anyhow::Error>(None)
    })
    .await
    .context("timed out waiting for enrollment to finish")??;

    match outcome {
        Some(message) => println!("{message}"),
        None => println!("daemon went away before enrollment finished"),
    }
    Ok(())
}

/// Capture a single frame directly from `device` and write it to `output`.
fn camera_test(device: &str, output: &std::path::Path) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} [{}] {}", d.path, d.name, d.driver, d.bus);
    }

    tracing::debug!(device, "opening camera for diagnostics");
    let mut camera = Camera::open(device).with_context(|| format!("cannot open {device}"))?;
    println!(
        "Opened {}: {}x{} {:?}",
        camera.describe(),
        camera.width,
        camera.height,
        camera.pixel_format
    );

    let started = std::time::Instant::now();
    let frame = camera.next_frame()?;
    println!(
        "Captured frame #{} in {:?}",
        frame.sequence,
        started.elapsed()
    );

    frame
        .image
        .save(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}
