//! Face boxes and labels drawn onto the display frame.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rollcall_core::{FaceRegion, RecognitionResult};
use std::path::Path;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
/// Gap between the label baseline and the top of the box.
const LABEL_GAP: i32 = 10;
const LABEL_SCALE: f32 = 20.0;

pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    /// Load the label font if one is configured. An unreadable or invalid
    /// font is logged and labels are skipped.
    pub fn from_font_path(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            tracing::info!("no label font configured; drawing boxes only");
            return Self::new(None);
        };
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                tracing::info!(path = %path.display(), "label font loaded");
                Self::new(Some(font))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "label font unavailable; drawing boxes only");
                Self::new(None)
            }
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn annotate(&self, canvas: &mut RgbImage, region: &FaceRegion, result: &RecognitionResult) {
        for inset in 0..BOX_THICKNESS {
            let side = region.size.saturating_sub(2 * inset);
            if side == 0 {
                break;
            }
            let rect = Rect::at((region.x + inset) as i32, (region.y + inset) as i32).of_size(side, side);
            draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
        }

        if let Some(font) = &self.font {
            let top = region.y as i32 - LABEL_GAP - LABEL_SCALE as i32;
            draw_text_mut(
                canvas,
                BOX_COLOR,
                region.x as i32,
                top,
                PxScale::from(LABEL_SCALE),
                font,
                result.label(),
            );
        }
    }
}
