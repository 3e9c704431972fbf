use anyhow::Result;
use rollcall_core::{FaceDetector, LbphClassifier, TrainedModel};
use rollcall_hw::{Camera, CameraError, FrameSource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod annotate;
mod bridge;
mod config;
mod dbus_interface;
mod display;
mod engine;

use annotate::Annotator;
use bridge::AccessBridge;
use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use display::Dashboard;
use engine::{Pipeline, SessionController, SourceOpener};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    // Missing artifacts degrade to an empty locator / model; never fatal.
    let locator = Arc::new(FaceDetector::load_or_empty(&config.cascade_path.to_string_lossy()));
    let model = TrainedModel::load_or_empty(&config.model_path(), &config.labels_path());
    let classifier = Arc::new(LbphClassifier::new(model, config.match_threshold));
    let annotator = Arc::new(Annotator::from_font_path(config.font_path.as_deref()));
    let dashboard = Arc::new(Dashboard::new(config.snapshot_path.clone(), config.snapshot_every));

    let bridge = Arc::new(AccessBridge::new());
    let bridge_task = tokio::spawn(Arc::clone(&bridge).run(config.mqtt()));

    let pipeline = Pipeline {
        locator,
        classifier,
        annotator,
        display: dashboard.clone(),
        access: bridge.subscribe(),
        tick: config.tick(),
    };

    let device = config.camera_device.clone();
    let opener: Arc<SourceOpener> = Arc::new(move || -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&device)?;
        tracing::info!(
            device = %device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        Ok(Box::new(camera))
    });
    let controller = Arc::new(SessionController::new(pipeline, opener));

    let service = AttendanceService {
        controller: Arc::clone(&controller),
        bridge: Arc::clone(&bridge),
        dashboard: Arc::clone(&dashboard),
        camera_device: config.camera_device.clone(),
        match_threshold: config.match_threshold,
    };
    let _connection = match zbus::connection::Builder::session()
        .and_then(|b| b.name(BUS_NAME))
        .and_then(|b| b.serve_at(OBJECT_PATH, service))
    {
        Ok(builder) => match builder.build().await {
            Ok(conn) => {
                tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; sessions can only autostart");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable; sessions can only autostart");
            None
        }
    };

    if config.autostart {
        let c = Arc::clone(&controller);
        match tokio::task::spawn_blocking(move || c.start()).await? {
            Ok(_) => tracing::info!("session autostarted"),
            Err(e) => tracing::warn!(error = %e, "autostart failed"),
        }
    }

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let c = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || c.stop()).await?;
    bridge_task.abort();

    Ok(())
}
