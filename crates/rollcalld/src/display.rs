//! Display surface the recognition loop publishes to.

use crate::engine::SessionState;
use chrono::{DateTime, Local};
use image::{ImageFormat, RgbImage};
use parking_lot::RwLock;
use rollcall_core::{AccessEvent, Feedback};
use serde::Serialize;
use std::path::PathBuf;

/// Sink for everything the recognition loop shows the operator.
pub trait DisplaySurface: Send + Sync {
    fn show_frame(&self, frame: &RgbImage, caption: &str);
    fn show_feedback(&self, feedback: &Feedback);
    fn show_last_access(&self, event: &AccessEvent);
    fn attendance_marked(&self, name: &str, at: DateTime<Local>);
    fn warn(&self, message: &str);
    fn session_changed(&self, state: SessionState);
}

#[derive(Debug, Clone, Serialize)]
pub struct MarkedEntry {
    pub name: String,
    pub at: String,
}

/// What the dashboard currently shows, as reported by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardState {
    pub session: SessionState,
    pub caption: String,
    pub frames_shown: u64,
    pub feedback: Option<String>,
    pub last_access: Option<String>,
    pub marked: Vec<MarkedEntry>,
    pub last_warning: Option<String>,
}

impl Default for DashboardState {
    fn default() -> Self {
        Self {
            session: SessionState::Stopped,
            caption: String::new(),
            frames_shown: 0,
            feedback: None,
            last_access: None,
            marked: Vec::new(),
            last_warning: None,
        }
    }
}

/// Headless dashboard: keeps the latest state, logs changes and writes a
/// JPEG of the annotated frame every `snapshot_every` frames.
pub struct Dashboard {
    state: RwLock<DashboardState>,
    snapshot_path: Option<PathBuf>,
    snapshot_every: u64,
}

impl Dashboard {
    pub fn new(snapshot_path: Option<PathBuf>, snapshot_every: u64) -> Self {
        Self {
            state: RwLock::new(DashboardState::default()),
            snapshot_path,
            snapshot_every: snapshot_every.max(1),
        }
    }

    pub fn state(&self) -> DashboardState {
        self.state.read().clone()
    }

    fn write_snapshot(&self, frame: &RgbImage) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        if let Err(e) = frame.save_with_format(path, ImageFormat::Jpeg) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot");
        }
    }
}

impl DisplaySurface for Dashboard {
    fn show_frame(&self, frame: &RgbImage, caption: &str) {
        let frames = {
            let mut state = self.state.write();
            if state.caption != caption {
                caption.clone_into(&mut state.caption);
            }
            state.frames_shown += 1;
            state.frames_shown
        };
        if frames % self.snapshot_every == 0 {
            self.write_snapshot(frame);
        }
    }

    fn show_feedback(&self, feedback: &Feedback) {
        let text = feedback.to_string();
        let mut state = self.state.write();
        if state.feedback.as_deref() != Some(text.as_str()) {
            tracing::info!(feedback = %text, "feedback changed");
            state.feedback = Some(text);
        }
    }

    fn show_last_access(&self, event: &AccessEvent) {
        let summary = event.summary();
        let mut state = self.state.write();
        if state.last_access.as_deref() != Some(summary.as_str()) {
            tracing::debug!(name = %event.name, "last access updated");
            state.last_access = Some(summary);
        }
    }

    fn attendance_marked(&self, name: &str, at: DateTime<Local>) {
        self.state.write().marked.push(MarkedEntry {
            name: name.to_string(),
            at: at.format("%Y-%m-%d %H:%M:%S").to_string(),
        });
    }

    fn warn(&self, message: &str) {
        tracing::warn!(warning = message, "dashboard warning");
        self.state.write().last_warning = Some(message.to_string());
    }

    fn session_changed(&self, session: SessionState) {
        tracing::info!(%session, "session state changed");
        let mut state = self.state.write();
        if session == SessionState::Running {
            state.frames_shown = 0;
            state.feedback = None;
            state.marked.clear();
            state.last_warning = None;
        }
        state.session = session;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::AccessStatus;

    #[test]
    fn test_feedback_and_access_recorded() {
        let dashboard = Dashboard::new(None, 1);
        dashboard.show_feedback(&Feedback::Welcome("Alice".into()));
        dashboard.show_last_access(&AccessEvent {
            name: "Bob".into(),
            status: AccessStatus::Granted,
            timestamp: "09:00".into(),
        });

        let state = dashboard.state();
        assert_eq!(state.feedback.as_deref(), Some("✅ Welcome, Alice!"));
        assert!(state.last_access.unwrap().contains("✅ Granted"));
    }

    #[test]
    fn test_new_session_resets_marks() {
        let dashboard = Dashboard::new(None, 1);
        dashboard.session_changed(SessionState::Running);
        dashboard.attendance_marked("Alice", Local::now());
        dashboard.show_frame(&RgbImage::new(4, 4), "Live Camera Feed");
        dashboard.session_changed(SessionState::Stopped);

        let state = dashboard.state();
        assert_eq!(state.marked.len(), 1);
        assert_eq!(state.frames_shown, 1);
        assert_eq!(state.caption, "Live Camera Feed");

        dashboard.session_changed(SessionState::Running);
        let state = dashboard.state();
        assert!(state.marked.is_empty());
        assert_eq!(state.frames_shown, 0);
        assert_eq!(state.session, SessionState::Running);
    }

    #[test]
    fn test_snapshot_written_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jpg");
        let dashboard = Dashboard::new(Some(path.clone()), 2);

        dashboard.show_frame(&RgbImage::new(16, 16), "Live Camera Feed");
        assert!(!path.exists());
        dashboard.show_frame(&RgbImage::new(16, 16), "Live Camera Feed");
        assert!(path.exists());
    }
}
