use anyhow::Result;
use sightline_core::{EmbeddingProvider, GalleryStore, OnnxProvider};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod annotate;
mod config;
mod controller;
mod dbus_interface;
mod enroll;
mod state;
mod stream;

use controller::{Controller, V4lCameraOpener};
use dbus_interface::{RecognizerService, BUS_NAME, OBJECT_PATH};
use stream::StreamSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("sightlined starting");

    let config = config::Config::from_env();

    // Load models synchronously (fail-fast)
    let provider = OnnxProvider::load(&config.model_dir)?;
    let threshold = config
        .match_threshold
        .unwrap_or_else(|| provider.match_threshold());
    tracing::info!(
        model_dir = %config.model_dir.display(),
        threshold,
        "embedding provider ready"
    );

    let (mut controller, mut events) = Controller::new(
        GalleryStore::new(&config.gallery_path),
        Box::new(provider),
        Box::new(V4lCameraOpener::new(&config.camera_device)),
        StreamSettings {
            threshold,
            downsample_factor: config.downsample_factor,
            min_frame_interval: config.min_frame_interval,
        },
    );
    controller.load_known_faces();
    let controller = Arc::new(Mutex::new(controller));

    let service = RecognizerService::new(Arc::clone(&controller), config.snapshot_path.clone());
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    let iface = conn
        .object_server()
        .interface::<_, RecognizerService>(OBJECT_PATH)
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "sightlined ready");

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let c = Arc::clone(&controller);
                let message = tokio::task::spawn_blocking(move || {
                    c.lock().ok().map(|mut c| c.handle_event(event))
                })
                .await?;
                match message {
                    Some(message) => {
                        dbus_interface::emit_status(iface.signal_emitter(), &message).await
                    }
                    None => tracing::error!("controller lock poisoned; dropping worker event"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("sightlined shutting down");
    let c = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || {
        if let Ok(mut c) = c.lock() {
            c.shutdown();
        }
    })
    .await?;

    Ok(())
}
