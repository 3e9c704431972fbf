use crate::bridge::MqttSettings;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory holding `trained_model.yml` and `label_mapping.txt`.
    pub model_dir: PathBuf,
    /// Haar cascade XML for the face locator.
    pub cascade_path: PathBuf,
    /// LBPH distances at or above this are treated as unknown faces.
    pub match_threshold: f64,
    /// Pause between recognition loop iterations.
    pub tick_ms: u64,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_client_id: String,
    /// Delay before polling the broker again after a connection error.
    pub mqtt_retry_secs: u64,
    /// Where the dashboard writes its JPEG snapshot; unset disables snapshots.
    pub snapshot_path: Option<PathBuf>,
    /// Write the snapshot every N displayed frames.
    pub snapshot_every: u64,
    /// TrueType font for face labels. Without one only boxes are drawn.
    pub font_path: Option<PathBuf>,
    /// Start a session as soon as the daemon is up.
    pub autostart: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let cascade_path = std::env::var("ROLLCALL_CASCADE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| model_dir.join("haarcascade_frontalface_default.xml"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            cascade_path,
            match_threshold: env_f64(
                "ROLLCALL_MATCH_THRESHOLD",
                rollcall_core::DEFAULT_MATCH_THRESHOLD,
            ),
            tick_ms: env_u64("ROLLCALL_TICK_MS", 30),
            mqtt_host: std::env::var("ROLLCALL_MQTT_HOST")
                .unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: env_u16("ROLLCALL_MQTT_PORT", 1883),
            mqtt_topic: std::env::var("ROLLCALL_MQTT_TOPIC")
                .unwrap_or_else(|_| "smartlock/events".to_string()),
            mqtt_client_id: std::env::var("ROLLCALL_MQTT_CLIENT_ID")
                .unwrap_or_else(|_| "WebApp".to_string()),
            mqtt_retry_secs: env_u64("ROLLCALL_MQTT_RETRY_SECS", 5),
            snapshot_path: std::env::var("ROLLCALL_SNAPSHOT_PATH").ok().map(PathBuf::from),
            snapshot_every: env_u64("ROLLCALL_SNAPSHOT_EVERY", 30).max(1),
            font_path: std::env::var("ROLLCALL_FONT_PATH").ok().map(PathBuf::from),
            autostart: std::env::var("ROLLCALL_AUTOSTART")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Path to the LBPH model written by the trainer.
    pub fn model_path(&self) -> String {
        self.model_dir
            .join("trained_model.yml")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the label → name mapping written next to the model.
    pub fn labels_path(&self) -> String {
        self.model_dir
            .join("label_mapping.txt")
            .to_string_lossy()
            .into_owned()
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn mqtt(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            topic: self.mqtt_topic.clone(),
            client_id: self.mqtt_client_id.clone(),
            retry: Duration::from_secs(self.mqtt_retry_secs),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_helpers_fall_back_on_garbage() {
        std::env::set_var("ROLLCALL_TEST_GARBAGE_U16", "not-a-port");
        assert_eq!(env_u16("ROLLCALL_TEST_GARBAGE_U16", 1883), 1883);
        std::env::set_var("ROLLCALL_TEST_GOOD_F64", "55.5");
        assert_eq!(env_f64("ROLLCALL_TEST_GOOD_F64", 70.0), 55.5);
        assert_eq!(env_u64("ROLLCALL_TEST_UNSET_U64", 30), 30);
    }

    #[test]
    fn test_artifact_paths_follow_model_dir() {
        let config = Config {
            model_dir: PathBuf::from("/srv/rollcall"),
            ..Config::from_env()
        };
        assert_eq!(config.model_path(), "/srv/rollcall/trained_model.yml");
        assert_eq!(config.labels_path(), "/srv/rollcall/label_mapping.txt");
    }
}
