//! Frame type and pixel conversion — YUYV/GREY to BGR, BGR to gray and RGB.

/// A captured camera frame in packed BGR order (3 bytes per pixel).
#[derive(Clone)]
pub struct Frame {
    /// Packed BGR pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Wrap an already-packed BGR buffer, validating its length.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Luma plane of this frame (width * height bytes).
    pub fn grayscale(&self) -> Vec<u8> {
        bgr_to_grayscale(&self.data)
    }

    /// RGB copy of this frame for display.
    pub fn rgb(&self) -> Vec<u8> {
        bgr_to_rgb(&self.data)
    }
}

/// Convert packed BGR to 8-bit luma using the BT.601 weights
/// (Y = 0.299 R + 0.587 G + 0.114 B).
pub fn bgr_to_grayscale(bgr: &[u8]) -> Vec<u8> {
    bgr.chunks_exact(3)
        .map(|px| {
            let b = px[0] as u32;
            let g = px[1] as u32;
            let r = px[2] as u32;
            // Fixed-point with 14 fractional bits, rounded.
            ((r * 4899 + g * 9617 + b * 1868 + (1 << 13)) >> 14) as u8
        })
        .collect()
}

/// Swap packed BGR into packed RGB.
pub fn bgr_to_rgb(bgr: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgr.len());
    for px in bgr.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

/// Replicate an 8-bit grayscale plane into packed BGR.
pub fn grey_to_bgr(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    Ok(gray[..expected].iter().flat_map(|&y| [y, y, y]).collect())
}

/// Convert packed YUYV (4:2:2) to packed BGR.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair. Uses the BT.601 limited-range integer transform.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut bgr = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as i32 - 128;
        let v = quad[3] as i32 - 128;
        for y in [quad[0], quad[2]] {
            let c = (y as i32 - 16).max(0) * 298;
            let r = (c + 409 * v + 128) >> 8;
            let g = (c - 100 * u - 208 * v + 128) >> 8;
            let b = (c + 516 * u + 128) >> 8;
            bgr.extend_from_slice(&[clamp_u8(b), clamp_u8(g), clamp_u8(r)]);
        }
    }
    Ok(bgr)
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
