use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Square face region carved from a frame, always inside the frame bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

impl FaceRegion {
    /// Square up a raw detection box and pull it back inside the frame.
    ///
    /// The side is `max(w, h)` (capped to the smaller frame dimension), the
    /// square keeps the box centre, and the origin is clamped to
    /// `[0, frame_w - size] × [0, frame_h - size]`.
    pub fn square_within(x: i32, y: i32, w: i32, h: i32, frame_w: u32, frame_h: u32) -> Self {
        let fw = frame_w as i64;
        let fh = frame_h as i64;
        let size = (w.max(h) as i64).min(fw).min(fh).max(0);

        let center_x = x as i64 + w as i64 / 2;
        let center_y = y as i64 + h as i64 / 2;
        let x_new = (center_x - size / 2).max(0).min(fw - size);
        let y_new = (center_y - size / 2).max(0).min(fh - size);

        Self {
            x: x_new as u32,
            y: y_new as u32,
            size: size as u32,
        }
    }

    /// Copy this region out of a grayscale frame.
    pub fn crop(&self, gray: &GrayImage) -> GrayImage {
        image::imageops::crop_imm(gray, self.x, self.y, self.size, self.size).to_image()
    }
}

/// Outcome of classifying one face crop.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionResult {
    Identified {
        name: String,
        /// LBPH distance of the match (lower = more similar).
        confidence: f64,
    },
    Unknown,
}

impl RecognitionResult {
    /// Label drawn next to the face box.
    pub fn label(&self) -> &str {
        match self {
            Self::Identified { name, .. } => name,
            Self::Unknown => "Unknown",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Identified { name, .. } => Some(name),
            Self::Unknown => None,
        }
    }
}

/// Per-frame feedback shown next to the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Welcome(String),
    NotRecognized,
}

impl Feedback {
    pub fn from_result(result: &RecognitionResult) -> Self {
        match result {
            RecognitionResult::Identified { name, .. } => Self::Welcome(name.clone()),
            RecognitionResult::Unknown => Self::NotRecognized,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Welcome(_))
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome(name) => write!(f, "✅ Welcome, {name}!"),
            Self::NotRecognized => write!(f, "❌ Face not recognized"),
        }
    }
}

/// Smart-lock decision carried by an access event.
///
/// Anything other than `granted` reads as denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum AccessStatus {
    Granted,
    Denied,
}

impl From<String> for AccessStatus {
    fn from(s: String) -> Self {
        if s == "granted" {
            Self::Granted
        } else {
            Self::Denied
        }
    }
}

/// Most recent access-control notification from the smart lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub name: String,
    pub status: AccessStatus,
    pub timestamp: String,
}

impl AccessEvent {
    /// Text block rendered beside the feed.
    pub fn summary(&self) -> String {
        let status = match self.status {
            AccessStatus::Granted => "✅ Granted",
            AccessStatus::Denied => "❌ Denied",
        };
        format!(
            "Last Access Attempt\n- Name: {}\n- Status: {status}\n- Time: {}",
            self.name, self.timestamp
        )
    }
}

/// Finds candidate faces in a grayscale frame.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion>;
}

/// Maps a square grayscale face crop to an identity.
///
/// Implementations never fail: internal errors come back as `Unknown`.
pub trait IdentityClassifier: Send + Sync {
    fn classify(&self, crop: &GrayImage) -> RecognitionResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_within_top_left_corner() {
        let region = FaceRegion::square_within(0, 0, 40, 40, 100, 100);
        assert_eq!(region, FaceRegion { x: 0, y: 0, size: 40 });
    }

    #[test]
    fn test_square_within_uses_longer_side() {
        // 20x40 box centred at (30, 40) → 40x40 square centred there
        let region = FaceRegion::square_within(20, 20, 20, 40, 100, 100);
        assert_eq!(region, FaceRegion { x: 10, y: 20, size: 40 });
    }

    #[test]
    fn test_square_within_clamps_far_edge() {
        let region = FaceRegion::square_within(80, 85, 30, 30, 100, 100);
        assert_eq!(region.size, 30);
        assert_eq!(region.x, 70);
        assert_eq!(region.y, 70);
    }

    #[test]
    fn test_square_within_bounds_property() {
        let (fw, fh) = (64u32, 48u32);
        for x in (-10..70).step_by(7) {
            for y in (-10..60).step_by(5) {
                for (w, h) in [(30, 30), (31, 45), (50, 20), (60, 60)] {
                    let r = FaceRegion::square_within(x, y, w, h, fw, fh);
                    assert!(r.size <= fw.min(fh));
                    assert!(r.x <= fw - r.size, "x={} size={}", r.x, r.size);
                    assert!(r.y <= fh - r.size, "y={} size={}", r.y, r.size);
                }
            }
        }
    }

    #[test]
    fn test_crop_dimensions() {
        let gray = GrayImage::new(100, 80);
        let crop = FaceRegion { x: 10, y: 5, size: 30 }.crop(&gray);
        assert_eq!(crop.dimensions(), (30, 30));
    }

    #[test]
    fn test_feedback_text() {
        let hit = RecognitionResult::Identified { name: "Alice".into(), confidence: 12.0 };
        assert_eq!(Feedback::from_result(&hit).to_string(), "✅ Welcome, Alice!");
        assert_eq!(
            Feedback::from_result(&RecognitionResult::Unknown).to_string(),
            "❌ Face not recognized"
        );
        assert_eq!(RecognitionResult::Unknown.label(), "Unknown");
    }

    #[test]
    fn test_access_event_parse() {
        let ev: AccessEvent = serde_json::from_str(
            r#"{"name":"Bob","status":"granted","timestamp":"2024-03-01 09:00:00"}"#,
        )
        .unwrap();
        assert_eq!(ev.status, AccessStatus::Granted);

        let ev: AccessEvent =
            serde_json::from_str(r#"{"name":"Eve","status":"forced","timestamp":"t"}"#).unwrap();
        assert_eq!(ev.status, AccessStatus::Denied);
    }

    #[test]
    fn test_access_event_missing_field_rejected() {
        let result = serde_json::from_str::<AccessEvent>(r#"{"name":"Bob"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_access_summary() {
        let ev = AccessEvent {
            name: "Bob".into(),
            status: AccessStatus::Denied,
            timestamp: "noon".into(),
        };
        assert_eq!(
            ev.summary(),
            "Last Access Attempt\n- Name: Bob\n- Status: ❌ Denied\n- Time: noon"
        );
    }
}
