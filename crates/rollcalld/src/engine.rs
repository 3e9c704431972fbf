use crate::annotate::Annotator;
use crate::display::DisplaySurface;
use image::{GrayImage, RgbImage};
use parking_lot::Mutex;
use rollcall_core::{AccessEvent, AttendanceDedup, FaceLocator, Feedback, IdentityClassifier};
use rollcall_hw::{CameraError, FrameSource};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

const CAPTION: &str = "Live Camera Feed";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session thread exited before opening the camera")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running => f.write_str("running"),
        }
    }
}

/// Opens the frame source for a session. Called on the session thread, so
/// the source itself never crosses threads.
pub type SourceOpener = dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync;

/// Process-wide, immutable pieces every session shares.
#[derive(Clone)]
pub struct Pipeline {
    pub locator: Arc<dyn FaceLocator>,
    pub classifier: Arc<dyn IdentityClassifier>,
    pub annotator: Arc<Annotator>,
    pub display: Arc<dyn DisplaySurface>,
    pub access: watch::Receiver<Option<AccessEvent>>,
    pub tick: Duration,
}

/// State owned by one running session: the dedup store and frame counter.
pub struct Session {
    pipeline: Pipeline,
    dedup: AttendanceDedup,
    frames: Arc<AtomicU64>,
}

impl Session {
    pub fn new(pipeline: Pipeline, frames: Arc<AtomicU64>) -> Self {
        Self {
            pipeline,
            dedup: AttendanceDedup::new(),
            frames,
        }
    }

    pub fn dedup(&self) -> &AttendanceDedup {
        &self.dedup
    }

    /// One loop iteration: capture, locate, classify, annotate, mark, publish.
    ///
    /// Returns the feedback shown for this frame (the last face wins), or
    /// `None` when no face was found.
    pub fn step(&mut self, source: &mut dyn FrameSource) -> Result<Option<Feedback>, CameraError> {
        let frame = source.read_frame()?;
        let mismatch = || CameraError::CaptureFailed("frame buffer does not match its dimensions".into());
        let gray = GrayImage::from_raw(frame.width, frame.height, frame.grayscale()).ok_or_else(mismatch)?;
        let mut canvas = RgbImage::from_raw(frame.width, frame.height, frame.rgb()).ok_or_else(mismatch)?;

        let p = &self.pipeline;
        let regions = p.locator.locate(&gray);
        let mut feedback = None;

        for region in &regions {
            let result = p.classifier.classify(&region.crop(&gray));
            p.annotator.annotate(&mut canvas, region, &result);

            if let Some(name) = result.name() {
                if self.dedup.mark_if_new(name) {
                    let at = self.dedup.last_seen(name).unwrap_or_else(chrono::Local::now);
                    tracing::info!(name, time = %at.format("%H:%M:%S"), "attendance marked");
                    p.display.attendance_marked(name, at);
                }
            }
            feedback = Some(Feedback::from_result(&result));
        }

        let latest = p.access.borrow().clone();
        if let Some(event) = latest {
            p.display.show_last_access(&event);
        }

        p.display.show_frame(&canvas, CAPTION);
        if let Some(fb) = &feedback {
            p.display.show_feedback(fb);
        }

        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(frame = n, faces = regions.len(), "frame processed");
        Ok(feedback)
    }

    /// Loop until `running` clears or a capture fails. The source is dropped
    /// (releasing the camera) on every exit path.
    pub fn run(mut self, mut source: Box<dyn FrameSource>, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            if let Err(e) = self.step(source.as_mut()) {
                tracing::warn!(error = %e, "capture failed; stopping session");
                self.pipeline.display.warn("Failed to capture frame");
                running.store(false, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(self.pipeline.tick);
        }

        drop(source);
        tracing::info!(
            frames = self.frames.load(Ordering::Relaxed),
            marked = self.dedup.len(),
            "session ended"
        );
        self.pipeline.display.session_changed(SessionState::Stopped);
    }
}

/// Starts and stops sessions on a dedicated `rollcall-session` thread.
pub struct SessionController {
    pipeline: Pipeline,
    opener: Arc<SourceOpener>,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(pipeline: Pipeline, opener: Arc<SourceOpener>) -> Self {
        Self {
            pipeline,
            opener,
            running: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Open the camera and start a fresh session.
    ///
    /// Returns `Ok(false)` if a session is already running. Blocks until the
    /// session thread has either opened its source or failed to, so must not
    /// be called from an async context.
    pub fn start(&self) -> Result<bool, SessionError> {
        let mut worker = self.worker.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        // A session that stopped itself still needs joining.
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        self.running.store(true, Ordering::SeqCst);
        self.frames.store(0, Ordering::Relaxed);

        let (opened_tx, opened_rx) = oneshot::channel::<Result<(), CameraError>>();
        let pipeline = self.pipeline.clone();
        let opener = Arc::clone(&self.opener);
        let running = Arc::clone(&self.running);
        let frames = Arc::clone(&self.frames);

        let spawned = std::thread::Builder::new()
            .name("rollcall-session".into())
            .spawn(move || {
                let source = match opener() {
                    Ok(source) => source,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                pipeline.display.session_changed(SessionState::Running);
                let _ = opened_tx.send(Ok(()));
                tracing::info!("session thread started");
                Session::new(pipeline, frames).run(source, &running);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(SessionError::Spawn(e));
            }
        };

        match opened_rx.blocking_recv() {
            Ok(Ok(())) => {
                *worker = Some(handle);
                tracing::info!("session started");
                Ok(true)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                tracing::warn!(error = %e, "session failed to open camera");
                Err(e.into())
            }
            Err(_) => {
                let _ = handle.join();
                self.running.store(false, Ordering::SeqCst);
                Err(SessionError::ChannelClosed)
            }
        }
    }

    /// Stop the session and wait for the camera to be released.
    ///
    /// Returns whether a session was running.
    pub fn stop(&self) -> bool {
        let mut worker = self.worker.lock();
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::warn!("session thread panicked");
            }
        }
        if was_running {
            tracing::info!("session stopped");
        }
        was_running
    }

    pub fn state(&self) -> SessionState {
        if self.running.load(Ordering::SeqCst) {
            SessionState::Running
        } else {
            SessionState::Stopped
        }
    }

    /// Frames processed by the current (or last) session.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}
