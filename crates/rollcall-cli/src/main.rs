use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::AccessEvent;
use rollcall_hw::Camera;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a recognition session
    Start,
    /// Stop the running session and release the camera
    Stop,
    /// Show daemon status
    Status,
    /// List names marked present in the current session
    Marked,
    /// Show the most recent smart-lock access event
    LastAccess,
    /// List V4L2 capture devices
    Devices,
    /// Grab one frame straight from the camera (bypasses the daemon)
    Snapshot {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Output image path
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
        /// Frames to discard first while exposure settles
        #[arg(long, default_value_t = 4)]
        warmup: usize,
    },
}

// `#[zbus::proxy]` generates `AttendanceProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn start_session(&self) -> zbus::Result<bool>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn last_access(&self) -> zbus::Result<String>;
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            if proxy().await?.start_session().await? {
                println!("Session started");
            } else {
                println!("Session already running");
            }
        }
        Commands::Stop => {
            if proxy().await?.stop_session().await? {
                println!("Session stopped; camera released");
            } else {
                println!("No session running");
            }
        }
        Commands::Status => {
            let status = proxy().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Marked => {
            let status: serde_json::Value = serde_json::from_str(&proxy().await?.status().await?)?;
            let marked = status["marked"].as_array().cloned().unwrap_or_default();
            if marked.is_empty() {
                println!("Nobody marked yet");
            }
            for entry in marked {
                println!(
                    "{}  {}",
                    entry["at"].as_str().unwrap_or("-"),
                    entry["name"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::LastAccess => {
            let raw = proxy().await?.last_access().await?;
            if raw.is_empty() {
                println!("No access events received");
            } else {
                let event: AccessEvent = serde_json::from_str(&raw)?;
                println!("{}", event.summary());
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Snapshot {
            device,
            output,
            warmup,
        } => {
            let mut camera = Camera::open(&device)?;
            println!(
                "{}: {}x{} {:?}",
                device, camera.width, camera.height, camera.fourcc
            );
            for _ in 0..warmup {
                let _ = camera.capture_frame();
            }
            let frame = camera.capture_frame()?;
            let rgb = image::RgbImage::from_raw(frame.width, frame.height, frame.rgb())
                .context("captured frame has inconsistent dimensions")?;
            rgb.save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Saved frame #{} to {}", frame.sequence, output.display());
        }
    }

    Ok(())
}
