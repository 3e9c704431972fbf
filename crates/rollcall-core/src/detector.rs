//! Haar cascade face detector.
//!
//! Multi-scale sliding-window evaluation over integral images, followed by
//! neighbour grouping of the raw hits and squaring of each grouped box.

use crate::cascade::{Cascade, CascadeError, WeakClassifier};
use crate::types::{FaceLocator, FaceRegion};
use image::GrayImage;

// --- Detection parameters ---
const SCALE_FACTOR: f64 = 1.1;
const MIN_NEIGHBORS: usize = 5;
const MIN_FACE_SIZE: u32 = 30;
const GROUP_EPS: f64 = 0.2;
/// Slack subtracted from every stage threshold, as OpenCV does on load.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;

/// Axis-aligned detection box in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Cascade-backed face locator.
pub struct FaceDetector {
    cascade: Option<Cascade>,
}

impl FaceDetector {
    pub fn new(cascade: Cascade) -> Self {
        Self {
            cascade: Some(cascade),
        }
    }

    /// A detector with no cascade: every frame yields zero faces.
    pub fn empty() -> Self {
        Self { cascade: None }
    }

    /// Load the cascade XML, falling back to an empty detector when it is
    /// missing or unreadable.
    pub fn load_or_empty(path: &str) -> Self {
        match Cascade::load(path) {
            Ok(cascade) => Self::new(cascade),
            Err(CascadeError::NotFound(p)) => {
                tracing::warn!(path = %p, "cascade file not found; face detection disabled");
                Self::empty()
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to load cascade; face detection disabled");
                Self::empty()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cascade.is_none()
    }

    /// Raw grouped detections, before squaring.
    pub fn detect(&self, gray: &GrayImage) -> Vec<Rect> {
        let Some(cascade) = &self.cascade else {
            return Vec::new();
        };
        let hits = scan(cascade, gray);
        group_rectangles(&hits, MIN_NEIGHBORS, GROUP_EPS)
    }
}

impl FaceLocator for FaceDetector {
    fn locate(&self, gray: &GrayImage) -> Vec<FaceRegion> {
        let (width, height) = gray.dimensions();
        let regions: Vec<FaceRegion> = self
            .detect(gray)
            .into_iter()
            .map(|r| FaceRegion::square_within(r.x, r.y, r.width, r.height, width, height))
            .filter(|r| r.size > 0)
            .collect();
        tracing::trace!(faces = regions.len(), "located faces");
        regions
    }
}

/// Summed-area tables over a grayscale plane, one row/column of zero padding.
struct Integral {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl Integral {
    fn new(pixels: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sum = vec![0u64; stride * (height + 1)];
        let mut sqsum = vec![0u64; stride * (height + 1)];

        for y in 0..height {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..width {
                let p = pixels[y * width + x] as u64;
                row_sum += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn area(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let a = table[y * stride + x];
        let b = table[y * stride + x + w];
        let c = table[(y + h) * stride + x];
        let d = table[(y + h) * stride + x + w];
        d + a - b - c
    }

    fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::area(&self.sum, self.stride, x, y, w, h)
    }

    fn rect_sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::area(&self.sqsum, self.stride, x, y, w, h)
    }
}

/// Slide the base window over successively shrunk copies of the frame and
/// collect every window that passes all stages, in frame coordinates.
fn scan(cascade: &Cascade, gray: &GrayImage) -> Vec<Rect> {
    let (img_w, img_h) = gray.dimensions();
    let win_w = cascade.window_width;
    let win_h = cascade.window_height;
    let mut hits = Vec::new();

    let mut factor = 1.0f64;
    loop {
        let window_w = (win_w as f64 * factor).round() as u32;
        let window_h = (win_h as f64 * factor).round() as u32;
        let scaled_w = (img_w as f64 / factor).round() as u32;
        let scaled_h = (img_h as f64 / factor).round() as u32;

        if scaled_w < win_w || scaled_h < win_h {
            break;
        }
        if window_w > img_w || window_h > img_h {
            break;
        }

        if window_w >= MIN_FACE_SIZE && window_h >= MIN_FACE_SIZE {
            let scaled = if scaled_w == img_w && scaled_h == img_h {
                gray.as_raw().clone()
            } else {
                resize_bilinear(
                    gray.as_raw(),
                    img_w as usize,
                    img_h as usize,
                    scaled_w as usize,
                    scaled_h as usize,
                )
            };
            let integral = Integral::new(&scaled, scaled_w as usize, scaled_h as usize);
            let step = if factor > 2.0 { 1 } else { 2 };

            for y in (0..=(scaled_h - win_h) as usize).step_by(step) {
                for x in (0..=(scaled_w - win_w) as usize).step_by(step) {
                    if passes_cascade(cascade, &integral, x, y) {
                        hits.push(Rect {
                            x: (x as f64 * factor).round() as i32,
                            y: (y as f64 * factor).round() as i32,
                            width: window_w as i32,
                            height: window_h as i32,
                        });
                    }
                }
            }
        }

        factor *= SCALE_FACTOR;
    }

    hits
}

/// Evaluate every stage at one window origin.
fn passes_cascade(cascade: &Cascade, integral: &Integral, x: usize, y: usize) -> bool {
    let win_w = cascade.window_width as usize;
    let win_h = cascade.window_height as usize;

    // Variance normalisation over the window inset by one pixel.
    let (nw, nh) = (win_w - 2, win_h - 2);
    let area = (nw * nh) as f64;
    let sum = integral.rect_sum(x + 1, y + 1, nw, nh) as f64;
    let sqsum = integral.rect_sqsum(x + 1, y + 1, nw, nh) as f64;
    let nf = area * sqsum - sum * sum;
    let norm = if nf > 0.0 { nf.sqrt() } else { 1.0 };

    for stage in &cascade.stages {
        let stage_sum: f64 = stage
            .classifiers
            .iter()
            .map(|weak| eval_weak(cascade, weak, integral, x, y, norm))
            .sum();
        if stage_sum < stage.threshold as f64 - STAGE_THRESHOLD_EPS {
            return false;
        }
    }
    true
}

fn eval_weak(
    cascade: &Cascade,
    weak: &WeakClassifier,
    integral: &Integral,
    x: usize,
    y: usize,
    norm: f64,
) -> f64 {
    let mut idx = 0i32;
    // Children point strictly forward, so at most nodes.len() hops.
    for _ in 0..weak.nodes.len() {
        let node = &weak.nodes[idx as usize];
        let feature = &cascade.features[node.feature];
        let value: f64 = feature
            .rects
            .iter()
            .map(|r| {
                r.weight as f64
                    * integral.rect_sum(
                        x + r.x as usize,
                        y + r.y as usize,
                        r.width as usize,
                        r.height as usize,
                    ) as f64
            })
            .sum();
        idx = if value < node.threshold as f64 * norm {
            node.left
        } else {
            node.right
        };
        if idx <= 0 {
            break;
        }
    }
    weak.leaves[(-idx) as usize] as f64
}

/// Bilinear resize of a grayscale plane.
fn resize_bilinear(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * width + x0] as f32;
            let tr = src[y0 * width + x1] as f32;
            let bl = src[y1 * width + x0] as f32;
            let br = src[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    resized
}

/// Two boxes belong together when every edge is within `eps` of the mean
/// smaller side.
fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta
        && ((a.y - b.y).abs() as f64) <= delta
        && ((a.x + a.width - b.x - b.width).abs() as f64) <= delta
        && ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits, average each cluster, and keep clusters with more than
/// `min_neighbors` members that are not swallowed by a stronger cluster.
fn group_rectangles(rects: &[Rect], min_neighbors: usize, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let mut parent: Vec<usize> = (0..rects.len()).collect();
    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // root → (cluster slot)
    let mut slot_of = vec![usize::MAX; rects.len()];
    let mut sums: Vec<[i64; 4]> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if slot_of[root] == usize::MAX {
            slot_of[root] = sums.len();
            sums.push([0; 4]);
            counts.push(0);
        }
        let slot = slot_of[root];
        sums[slot][0] += r.x as i64;
        sums[slot][1] += r.y as i64;
        sums[slot][2] += r.width as i64;
        sums[slot][3] += r.height as i64;
        counts[slot] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let n = n as f64;
            Rect {
                x: (s[0] as f64 / n).round() as i32,
                y: (s[1] as f64 / n).round() as i32,
                width: (s[2] as f64 / n).round() as i32,
                height: (s[3] as f64 / n).round() as i32,
            }
        })
        .collect();

    let mut kept = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.width <= r2.x + r2.width + dx
                && r1.y + r1.height <= r2.y + r2.height + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            kept.push(*r1);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::{HaarFeature, Stage, WeightedRect};

    fn rect(x: i32, y: i32, w: i32, h: i32) -> Rect {
        Rect { x, y, width: w, height: h }
    }

    fn whole_window_feature() -> HaarFeature {
        HaarFeature {
            rects: vec![WeightedRect { x: 0, y: 0, width: 24, height: 24, weight: 1.0 }],
        }
    }

    /// Inner 12x12 block weighted against the full window: fires where the
    /// window centre is brighter than its surroundings.
    fn bright_centre_cascade() -> Cascade {
        let feature = HaarFeature {
            rects: vec![
                WeightedRect { x: 0, y: 0, width: 24, height: 24, weight: -1.0 },
                WeightedRect { x: 6, y: 6, width: 12, height: 12, weight: 4.0 },
            ],
        };
        let stage = Stage {
            threshold: 0.0,
            classifiers: vec![WeakClassifier::stump(0, 0.1, -1.0, 1.0)],
        };
        Cascade::new(24, 24, vec![stage], vec![feature]).unwrap()
    }

    fn accept_all_cascade() -> Cascade {
        let stage = Stage { threshold: -1.0, classifiers: vec![] };
        Cascade::new(24, 24, vec![stage], vec![whole_window_feature()]).unwrap()
    }

    fn reject_all_cascade() -> Cascade {
        let stage = Stage {
            threshold: 0.0,
            classifiers: vec![WeakClassifier::stump(0, 0.0, -1.0, -1.0)],
        };
        Cascade::new(24, 24, vec![stage], vec![whole_window_feature()]).unwrap()
    }

    #[test]
    fn test_integral_rect_sum() {
        // 3x2 plane:
        // 1 2 3
        // 4 5 6
        let pixels = [1u8, 2, 3, 4, 5, 6];
        let ii = Integral::new(&pixels, 3, 2);
        assert_eq!(ii.rect_sum(0, 0, 3, 2), 21);
        assert_eq!(ii.rect_sum(1, 0, 2, 2), 16);
        assert_eq!(ii.rect_sum(2, 1, 1, 1), 6);
        assert_eq!(ii.rect_sqsum(0, 1, 2, 1), 16 + 25);
    }

    #[test]
    fn test_empty_detector_finds_nothing() {
        let gray = GrayImage::from_pixel(100, 100, image::Luma([128]));
        assert!(FaceDetector::empty().locate(&gray).is_empty());
    }

    #[test]
    fn test_load_or_empty_missing_file() {
        let detector = FaceDetector::load_or_empty("/nonexistent/haarcascade.xml");
        assert!(detector.is_empty());
    }

    #[test]
    fn test_rejecting_cascade_returns_empty() {
        let gray = GrayImage::from_fn(100, 100, |x, y| image::Luma([((x * 7 + y * 3) % 256) as u8]));
        let detector = FaceDetector::new(reject_all_cascade());
        assert!(detector.locate(&gray).is_empty());
    }

    #[test]
    fn test_accept_all_regions_are_square_and_in_bounds() {
        let gray = GrayImage::from_pixel(80, 60, image::Luma([90]));
        let detector = FaceDetector::new(accept_all_cascade());
        let regions = detector.locate(&gray);
        assert!(!regions.is_empty());
        for r in regions {
            assert!(r.size >= MIN_FACE_SIZE);
            assert!(r.x + r.size <= 80);
            assert!(r.y + r.size <= 60);
        }
    }

    #[test]
    fn test_stage_threshold_has_slack() {
        // Stage sum 0 sits just under the threshold but within the slack.
        let stage = Stage { threshold: 5e-6, classifiers: vec![] };
        let cascade = Cascade::new(24, 24, vec![stage], vec![whole_window_feature()]).unwrap();
        let gray = GrayImage::from_pixel(80, 60, image::Luma([90]));
        assert!(!scan(&cascade, &gray).is_empty());

        let stage = Stage { threshold: 1e-3, classifiers: vec![] };
        let cascade = Cascade::new(24, 24, vec![stage], vec![whole_window_feature()]).unwrap();
        assert!(scan(&cascade, &gray).is_empty());
    }

    #[test]
    fn test_windows_below_min_size_skipped() {
        // 29x29 frame: no window of at least 30px fits.
        let gray = GrayImage::from_pixel(29, 29, image::Luma([90]));
        let detector = FaceDetector::new(accept_all_cascade());
        assert!(scan(detector.cascade.as_ref().unwrap(), &gray).is_empty());
    }

    #[test]
    fn test_bright_square_located() {
        let blank = GrayImage::from_pixel(100, 100, image::Luma([0]));
        let detector = FaceDetector::new(bright_centre_cascade());
        assert!(detector.locate(&blank).is_empty());

        let planted = GrayImage::from_fn(100, 100, |x, y| {
            let inside = (35..65).contains(&x) && (35..65).contains(&y);
            image::Luma([if inside { 255 } else { 0 }])
        });
        let regions = detector.locate(&planted);
        assert!(!regions.is_empty());
        for r in regions {
            // every region overlaps the planted square
            assert!(r.x < 65 && r.x + r.size > 35, "{r:?}");
            assert!(r.y < 65 && r.y + r.size > 35, "{r:?}");
        }
    }

    #[test]
    fn test_group_requires_more_than_min_neighbors() {
        let five = vec![rect(10, 10, 40, 40); 5];
        assert!(group_rectangles(&five, 5, GROUP_EPS).is_empty());

        let six = vec![rect(10, 10, 40, 40); 6];
        assert_eq!(group_rectangles(&six, 5, GROUP_EPS), vec![rect(10, 10, 40, 40)]);
    }

    #[test]
    fn test_group_averages_cluster() {
        let mut hits = vec![rect(10, 10, 40, 40); 3];
        hits.extend(vec![rect(12, 12, 40, 40); 3]);
        assert_eq!(group_rectangles(&hits, 5, GROUP_EPS), vec![rect(11, 11, 40, 40)]);
    }

    #[test]
    fn test_group_keeps_separate_clusters() {
        let mut hits = vec![rect(0, 0, 30, 30); 6];
        hits.extend(vec![rect(100, 100, 30, 30); 7]);
        let grouped = group_rectangles(&hits, 5, GROUP_EPS);
        assert_eq!(grouped.len(), 2);
    }

    #[test]
    fn test_group_drops_nested_weaker_cluster() {
        let mut hits = vec![rect(20, 20, 30, 30); 6];
        hits.extend(vec![rect(0, 0, 100, 100); 20]);
        let grouped = group_rectangles(&hits, 5, GROUP_EPS);
        assert_eq!(grouped, vec![rect(0, 0, 100, 100)]);
    }

    #[test]
    fn test_similar_predicate() {
        assert!(similar(&rect(0, 0, 40, 40), &rect(8, 8, 40, 40), 0.2));
        assert!(!similar(&rect(0, 0, 40, 40), &rect(9, 0, 40, 40), 0.2));
    }

    #[test]
    fn test_bilinear_resize_uniform() {
        let frame = vec![128u8; 100 * 100];
        let resized = resize_bilinear(&frame, 100, 100, 37, 53);
        assert_eq!(resized.len(), 37 * 53);
        assert!(resized.iter().all(|&p| p == 128), "uniform resize should stay uniform");
    }
}
