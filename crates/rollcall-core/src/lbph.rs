//! Local Binary Patterns Histograms (LBPH) face model.
//!
//! Reads the `opencv_lbphfaces` YAML written by OpenCV's trainer and predicts
//! the nearest training histogram under the alternative chi-square distance.

use image::GrayImage;
use serde_yaml::Value;
use std::path::Path;
use thiserror::Error;

const MAX_NEIGHBORS: u32 = 16;
const MAX_RADIUS: u32 = 64;
const MAX_GRID: u32 = 256;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(String),
    #[error("failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed model YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid model: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("model has no training histograms")]
    EmptyModel,
    #[error("crop {width}x{height} is too small for the LBPH grid")]
    CropTooSmall { width: u32, height: u32 },
    #[error("histogram length mismatch: expected {expected}, got {actual}")]
    HistogramMismatch { expected: usize, actual: usize },
}

/// Operator and grid parameters shared by training and prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Bins in a full spatial histogram, or `None` if that overflows `usize`.
    pub fn histogram_len(&self) -> Option<usize> {
        (self.grid_x as usize)
            .checked_mul(self.grid_y as usize)?
            .checked_mul(self.bins())
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.radius == 0 || self.grid_x == 0 || self.grid_y == 0 {
            return Err(ModelError::Invalid(format!("degenerate parameters: {self:?}")));
        }
        if self.neighbors == 0 || self.neighbors > MAX_NEIGHBORS {
            return Err(ModelError::Invalid(format!(
                "neighbors must be 1..={MAX_NEIGHBORS}, got {}",
                self.neighbors
            )));
        }
        if self.radius > MAX_RADIUS {
            return Err(ModelError::Invalid(format!(
                "radius must be 1..={MAX_RADIUS}, got {}",
                self.radius
            )));
        }
        if self.grid_x > MAX_GRID || self.grid_y > MAX_GRID {
            return Err(ModelError::Invalid(format!(
                "grid must be at most {MAX_GRID}x{MAX_GRID}, got {}x{}",
                self.grid_x, self.grid_y
            )));
        }
        Ok(())
    }

    /// Spatially-enhanced LBP histogram of a grayscale crop.
    pub fn histogram(&self, crop: &GrayImage) -> Result<Vec<f32>, ClassifierError> {
        let too_small = ClassifierError::CropTooSmall {
            width: crop.width(),
            height: crop.height(),
        };
        let (codes, width, height) =
            lbp_codes(crop, self.radius, self.neighbors).ok_or_else(|| too_small.clone())?;
        spatial_histogram(&codes, width, height, self).ok_or(too_small)
    }
}

/// Nearest-neighbour prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub distance: f64,
}

/// Trained LBPH state: one histogram per training sample plus its label.
#[derive(Debug, Clone)]
pub struct LbphModel {
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<i32>,
}

impl LbphModel {
    pub fn new(params: LbphParams, histograms: Vec<Vec<f32>>, labels: Vec<i32>) -> Result<Self, ModelError> {
        params.validate()?;
        if histograms.len() != labels.len() {
            return Err(ModelError::Invalid(format!(
                "{} histograms but {} labels",
                histograms.len(),
                labels.len()
            )));
        }
        let expected = params
            .histogram_len()
            .ok_or_else(|| ModelError::Invalid(format!("histogram size overflows: {params:?}")))?;
        if let Some(bad) = histograms.iter().find(|h| h.len() != expected) {
            return Err(ModelError::Invalid(format!(
                "histogram has {} bins, parameters imply {expected}",
                bad.len()
            )));
        }
        Ok(Self {
            params,
            histograms,
            labels,
        })
    }

    /// An untrained model; every prediction fails with `EmptyModel`.
    pub fn empty() -> Self {
        Self {
            params: LbphParams::default(),
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    pub fn load(path: &str) -> Result<Self, ModelError> {
        if !Path::new(path).exists() {
            return Err(ModelError::NotFound(path.to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let model = Self::from_yaml(&text)?;
        tracing::info!(
            path,
            samples = model.len(),
            params = ?model.params,
            "loaded LBPH model"
        );
        Ok(model)
    }

    /// Parse OpenCV FileStorage YAML (`opencv_lbphfaces`).
    pub fn from_yaml(text: &str) -> Result<Self, ModelError> {
        // OpenCV writes a `%YAML:1.0` directive that YAML parsers reject.
        let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('%')).collect();
        let doc: Value = serde_yaml::from_str(&body.join("\n"))?;
        let root = field(&doc, "opencv_lbphfaces")?;

        let params = LbphParams {
            radius: uint_field(root, "radius")?,
            neighbors: uint_field(root, "neighbors")?,
            grid_x: uint_field(root, "grid_x")?,
            grid_y: uint_field(root, "grid_y")?,
        };

        let histograms = match untag(field(root, "histograms")?) {
            Value::Sequence(items) => items
                .iter()
                .map(|m| Ok(matrix_data(m)?.into_iter().map(|v| v as f32).collect()))
                .collect::<Result<Vec<Vec<f32>>, ModelError>>()?,
            Value::Null => Vec::new(),
            other => {
                return Err(ModelError::Invalid(format!(
                    "histograms is not a sequence: {other:?}"
                )))
            }
        };
        let labels = matrix_data(field(root, "labels")?)?
            .into_iter()
            .map(|v| v as i32)
            .collect();

        Self::new(params, histograms, labels)
    }

    /// Nearest training sample to `crop`.
    pub fn predict(&self, crop: &GrayImage) -> Result<Prediction, ClassifierError> {
        if self.histograms.is_empty() {
            return Err(ClassifierError::EmptyModel);
        }
        let query = self.params.histogram(crop)?;

        let mut best = Prediction {
            label: -1,
            distance: f64::MAX,
        };
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            if hist.len() != query.len() {
                return Err(ClassifierError::HistogramMismatch {
                    expected: hist.len(),
                    actual: query.len(),
                });
            }
            let distance = chi_square_alt(hist, &query);
            if distance < best.distance {
                best = Prediction { label, distance };
            }
        }
        Ok(best)
    }
}

/// Extended (circular) LBP codes with bilinear-interpolated neighbours.
///
/// Returns the code plane and its dimensions, which are `2 * radius` smaller
/// than the input on each axis, or `None` when the crop is too small.
pub fn lbp_codes(img: &GrayImage, radius: u32, neighbors: u32) -> Option<(Vec<u32>, usize, usize)> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let r = radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return None;
    }
    let out_w = w - 2 * r;
    let out_h = h - 2 * r;
    let src = img.as_raw();
    let px = |y: usize, x: usize| src[y * w + x] as f32;
    let mut codes = vec![0u32; out_w * out_h];

    for n in 0..neighbors {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / neighbors as f64;
        let x = (radius as f64 * angle.cos()) as f32;
        let y = (-(radius as f64) * angle.sin()) as f32;

        let fx = x.floor() as isize;
        let fy = y.floor() as isize;
        let cx = x.ceil() as isize;
        let cy = y.ceil() as isize;
        let ty = y - fy as f32;
        let tx = x - fx as f32;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..h - r {
            for j in r..w - r {
                let at = |dy: isize, dx: isize| px((i as isize + dy) as usize, (j as isize + dx) as usize);
                let t = w1 * at(fy, fx) + w2 * at(fy, cx) + w3 * at(cy, fx) + w4 * at(cy, cx);
                let center = px(i, j);
                if t > center || (t - center).abs() < f32::EPSILON {
                    codes[(i - r) * out_w + (j - r)] |= 1 << n;
                }
            }
        }
    }

    Some((codes, out_w, out_h))
}

/// Concatenated per-cell histograms, each normalised by its cell area.
///
/// Cells are visited row-major over a `grid_y × grid_x` grid; pixels past the
/// last full cell are ignored. `None` when a cell would be empty.
pub fn spatial_histogram(codes: &[u32], width: usize, height: usize, params: &LbphParams) -> Option<Vec<f32>> {
    let grid_x = params.grid_x as usize;
    let grid_y = params.grid_y as usize;
    let cell_w = width / grid_x;
    let cell_h = height / grid_y;
    if cell_w == 0 || cell_h == 0 {
        return None;
    }

    let bins = params.bins();
    let area = (cell_w * cell_h) as f32;
    let mut result = vec![0f32; grid_x * grid_y * bins];

    for gy in 0..grid_y {
        for gx in 0..grid_x {
            let offset = (gy * grid_x + gx) * bins;
            let cell = &mut result[offset..offset + bins];
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    cell[codes[y * width + x] as usize] += 1.0;
                }
            }
            for bin in cell.iter_mut() {
                *bin /= area;
            }
        }
    }

    Some(result)
}

/// Alternative chi-square distance: `2 Σ (a - b)² / (a + b)`.
pub fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    let mut result = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let diff = x as f64 - y as f64;
        let sum = x as f64 + y as f64;
        if sum.abs() > f64::EPSILON {
            result += diff * diff / sum;
        }
    }
    2.0 * result
}

fn untag(value: &Value) -> &Value {
    match value {
        Value::Tagged(tagged) => untag(&tagged.value),
        other => other,
    }
}

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value, ModelError> {
    untag(value)
        .get(key)
        .map(untag)
        .ok_or_else(|| ModelError::Invalid(format!("missing field `{key}`")))
}

fn number(value: &Value) -> Option<f64> {
    match untag(value) {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn uint_field(value: &Value, key: &str) -> Result<u32, ModelError> {
    let v = number(field(value, key)?)
        .ok_or_else(|| ModelError::Invalid(format!("`{key}` is not a number")))?;
    if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        return Err(ModelError::Invalid(format!("`{key}` is not a non-negative integer: {v}")));
    }
    Ok(v as u32)
}

/// Flattened `data` of an `!!opencv-matrix`, checked against rows × cols.
fn matrix_data(value: &Value) -> Result<Vec<f64>, ModelError> {
    let rows = uint_field(value, "rows")? as usize;
    let cols = uint_field(value, "cols")? as usize;
    let data = match field(value, "data")? {
        Value::Sequence(items) => items
            .iter()
            .map(|v| number(v).ok_or_else(|| ModelError::Invalid(format!("non-numeric matrix entry {v:?}"))))
            .collect::<Result<Vec<f64>, ModelError>>()?,
        other => return Err(ModelError::Invalid(format!("matrix data is not a sequence: {other:?}"))),
    };
    if data.len() != rows * cols {
        return Err(ModelError::Invalid(format!(
            "matrix declares {rows}x{cols} but holds {} values",
            data.len()
        )));
    }
    Ok(data)
}
