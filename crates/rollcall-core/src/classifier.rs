//! Identity classifier: LBPH prediction gated by distance and label mapping.

use crate::lbph::{LbphModel, ModelError};
use crate::types::{IdentityClassifier, RecognitionResult};
use image::GrayImage;
use std::collections::HashMap;
use std::path::Path;

/// Matches at or above this LBPH distance are rejected.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 70.0;

/// Integer label → person name, as written next to the trained model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    names: HashMap<i32, String>,
}

impl LabelMap {
    /// Parse `label,name` lines. The `name,label` order is accepted too;
    /// whichever side is an integer is taken as the label. Blank and
    /// malformed lines are skipped; the first entry for a label wins.
    pub fn parse(text: &str) -> Self {
        let mut names = HashMap::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((left, right)) = line.split_once(',') else {
                tracing::warn!(line = lineno + 1, content = line, "label mapping line has no comma");
                continue;
            };
            let (left, right) = (left.trim(), right.trim());
            let (label, name) = match (left.parse::<i32>(), right.parse::<i32>()) {
                (Ok(label), _) => (label, right),
                (Err(_), Ok(label)) => (label, left),
                _ => {
                    tracing::warn!(line = lineno + 1, content = line, "label mapping line has no integer label");
                    continue;
                }
            };
            if name.is_empty() {
                tracing::warn!(line = lineno + 1, label, "label mapping line has an empty name");
                continue;
            }
            if names.contains_key(&label) {
                tracing::warn!(line = lineno + 1, label, "duplicate label ignored");
                continue;
            }
            names.insert(label, name.to_string());
        }

        Self { names }
    }

    pub fn load(path: &str) -> Result<Self, ModelError> {
        if !Path::new(path).exists() {
            return Err(ModelError::NotFound(path.to_string()));
        }
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn name(&self, label: i32) -> Option<&str> {
        self.names.get(&label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<(i32, String)> for LabelMap {
    fn from_iter<I: IntoIterator<Item = (i32, String)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// Classifier state plus its label names, loaded once at startup.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub lbph: LbphModel,
    pub labels: LabelMap,
}

impl TrainedModel {
    /// Load both artifacts; any that is missing or unreadable degrades to
    /// empty so the system still runs (every face then reads as unknown).
    pub fn load_or_empty(model_path: &str, labels_path: &str) -> Self {
        let lbph = LbphModel::load(model_path).unwrap_or_else(|e| {
            tracing::warn!(path = model_path, error = %e, "classifier model unavailable; all faces will be unknown");
            LbphModel::empty()
        });
        let labels = LabelMap::load(labels_path).unwrap_or_else(|e| {
            tracing::warn!(path = labels_path, error = %e, "label mapping unavailable");
            LabelMap::default()
        });
        tracing::info!(samples = lbph.len(), names = labels.len(), "trained model ready");
        Self { lbph, labels }
    }
}

/// LBPH-backed [`IdentityClassifier`].
pub struct LbphClassifier {
    model: TrainedModel,
    threshold: f64,
}

impl LbphClassifier {
    pub fn new(model: TrainedModel, threshold: f64) -> Self {
        Self { model, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl IdentityClassifier for LbphClassifier {
    fn classify(&self, crop: &GrayImage) -> RecognitionResult {
        let prediction = match self.model.lbph.predict(crop) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "classification failed; treating face as unknown");
                return RecognitionResult::Unknown;
            }
        };

        if prediction.distance >= self.threshold {
            return RecognitionResult::Unknown;
        }
        match self.model.labels.name(prediction.label) {
            Some(name) => RecognitionResult::Identified {
                name: name.to_string(),
                confidence: prediction.distance,
            },
            None => {
                tracing::debug!(label = prediction.label, "matched label has no name");
                RecognitionResult::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbph::LbphParams;
    use std::io::Write;

    fn uniform(size: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(size, size, image::Luma([value]))
    }

    fn gradient(size: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, _| image::Luma([(x * 3) as u8]))
    }

    /// Model trained on one flat face under label 1.
    fn flat_model(labels: LabelMap) -> TrainedModel {
        let params = LbphParams::default();
        let hist = params.histogram(&uniform(64, 120)).unwrap();
        TrainedModel {
            lbph: LbphModel::new(params, vec![hist], vec![1]).unwrap(),
            labels,
        }
    }

    fn alice() -> LabelMap {
        [(1, "Alice".to_string())].into_iter().collect()
    }

    #[test]
    fn test_parse_label_first() {
        let map = LabelMap::parse("0,Alice\n1,Bob\n");
        assert_eq!(map.name(0), Some("Alice"));
        assert_eq!(map.name(1), Some("Bob"));
    }

    #[test]
    fn test_parse_name_first() {
        let map = LabelMap::parse("Alice,0\nBob, 1\n");
        assert_eq!(map.name(0), Some("Alice"));
        assert_eq!(map.name(1), Some("Bob"));
    }

    #[test]
    fn test_parse_skips_malformed_and_duplicates() {
        let map = LabelMap::parse("\n0,Alice\nno comma\nx,y\n0,Mallory\n2,\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.name(0), Some("Alice"));
        assert_eq!(map.name(2), None);
    }

    #[test]
    fn test_parse_name_keeps_trailing_commas() {
        let map = LabelMap::parse("3,Smith, John\n");
        assert_eq!(map.name(3), Some("Smith, John"));
    }

    #[test]
    fn test_identified_below_threshold() {
        let classifier = LbphClassifier::new(flat_model(alice()), DEFAULT_MATCH_THRESHOLD);
        let result = classifier.classify(&uniform(64, 10));
        assert_eq!(
            result,
            RecognitionResult::Identified { name: "Alice".into(), confidence: 0.0 }
        );
    }

    #[test]
    fn test_distance_at_or_above_threshold_is_unknown() {
        // Gradient texture shares no LBP codes with the flat training face.
        let classifier = LbphClassifier::new(flat_model(alice()), DEFAULT_MATCH_THRESHOLD);
        assert_eq!(classifier.classify(&gradient(64)), RecognitionResult::Unknown);

        // Exact match (distance 0) still fails a zero threshold.
        let strict = LbphClassifier::new(flat_model(alice()), 0.0);
        assert_eq!(strict.classify(&uniform(64, 10)), RecognitionResult::Unknown);
    }

    #[test]
    fn test_label_missing_from_map_is_unknown() {
        let others: LabelMap = [(9, "Zed".to_string())].into_iter().collect();
        let classifier = LbphClassifier::new(flat_model(others), DEFAULT_MATCH_THRESHOLD);
        assert_eq!(classifier.classify(&uniform(64, 10)), RecognitionResult::Unknown);
    }

    #[test]
    fn test_failures_map_to_unknown() {
        let classifier = LbphClassifier::new(flat_model(alice()), DEFAULT_MATCH_THRESHOLD);
        // too small for an 8x8 grid
        assert_eq!(classifier.classify(&uniform(6, 10)), RecognitionResult::Unknown);

        let empty = LbphClassifier::new(
            TrainedModel { lbph: LbphModel::empty(), labels: alice() },
            DEFAULT_MATCH_THRESHOLD,
        );
        assert_eq!(empty.classify(&uniform(64, 10)), RecognitionResult::Unknown);
    }

    #[test]
    fn test_load_or_empty_missing_artifacts() {
        let model = TrainedModel::load_or_empty("/nonexistent/trained_model.yml", "/nonexistent/labels.txt");
        assert!(model.lbph.is_empty());
        assert!(model.labels.is_empty());
    }

    #[test]
    fn test_load_or_empty_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("trained_model.yml");
        let labels_path = dir.path().join("label_mapping.txt");

        let mut f = std::fs::File::create(&model_path).unwrap();
        write!(
            f,
            "%YAML:1.0\n---\nopencv_lbphfaces:\n   radius: 1\n   neighbors: 2\n   grid_x: 1\n   grid_y: 1\n   histograms:\n      - !!opencv-matrix\n         rows: 1\n         cols: 4\n         dt: f\n         data: [ 0., 0., 0., 1. ]\n   labels: !!opencv-matrix\n      rows: 1\n      cols: 1\n      dt: i\n      data: [ 4 ]\n"
        )
        .unwrap();
        std::fs::write(&labels_path, "4,Dana\n").unwrap();

        let model = TrainedModel::load_or_empty(
            model_path.to_str().unwrap(),
            labels_path.to_str().unwrap(),
        );
        assert_eq!(model.lbph.len(), 1);
        assert_eq!(model.labels.name(4), Some("Dana"));

        // A flat crop sets both LBP bits everywhere → bin 3, same as training.
        let classifier = LbphClassifier::new(model, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(classifier.classify(&uniform(16, 50)).name(), Some("Dana"));
    }
}
