use crate::bridge::AccessBridge;
use crate::display::Dashboard;
use crate::engine::SessionController;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus control surface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub controller: Arc<SessionController>,
    pub bridge: Arc<AccessBridge>,
    pub dashboard: Arc<Dashboard>,
    pub camera_device: String,
    pub match_threshold: f64,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Open the camera and begin a fresh session. False if one is already running.
    async fn start_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start_session requested");
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.start())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("session task failed: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Stop the running session and release the camera. False if none was running.
    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_session requested");
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.stop())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("session task failed: {e}")))
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let dashboard = self.dashboard.state();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": self.controller.state(),
            "camera": self.camera_device,
            "frames": self.controller.frames(),
            "match_threshold": self.match_threshold,
            "marked": dashboard.marked,
            "feedback": dashboard.feedback,
            "last_warning": dashboard.last_warning,
            "access_parse_errors": self.bridge.parse_errors(),
        })
        .to_string())
    }

    /// Latest access event as JSON, or an empty string when none has arrived.
    async fn last_access(&self) -> zbus::fdo::Result<String> {
        match self.bridge.latest() {
            Some(event) => serde_json::to_string(&event)
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string())),
            None => Ok(String::new()),
        }
    }
}
