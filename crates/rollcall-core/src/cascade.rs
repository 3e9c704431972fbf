//! Boosted Haar cascade model and OpenCV XML loading.
//!
//! Reads both the legacy `opencv-haar-classifier` layout (features inlined in
//! each tree node) and the newer `opencv-cascade-classifier` BOOST/HAAR layout
//! (shared feature table, `internalNodes`/`leafValues` per weak classifier).

use roxmltree::{Document, Node};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("tilted Haar features are not supported")]
    TiltedFeature,
}

/// One weighted rectangle of a Haar feature, in base-window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Internal tree node. A child `> 0` indexes another node; a child `<= 0`
/// indexes leaf `-child`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f32,
    pub left: i32,
    pub right: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

impl WeakClassifier {
    /// Single-split tree: `value < threshold` scores `left`, otherwise `right`.
    pub fn stump(feature: usize, threshold: f32, left: f32, right: f32) -> Self {
        Self {
            nodes: vec![TreeNode { feature, threshold, left: 0, right: -1 }],
            leaves: vec![left, right],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Validated cascade: base window, stages, and the feature table they index.
#[derive(Debug, Clone)]
pub struct Cascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl Cascade {
    /// Build a cascade, checking every index and rectangle against the window.
    pub fn new(
        window_width: u32,
        window_height: u32,
        stages: Vec<Stage>,
        features: Vec<HaarFeature>,
    ) -> Result<Self, CascadeError> {
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let fits = |start: u32, len: u32, limit: u32| start.checked_add(len).is_some_and(|end| end <= limit);
        for (fi, feature) in features.iter().enumerate() {
            for r in &feature.rects {
                if !fits(r.x, r.width, window_width) || !fits(r.y, r.height, window_height) {
                    return Err(CascadeError::Invalid(format!(
                        "feature {fi} rect {r:?} exceeds {window_width}x{window_height} window"
                    )));
                }
            }
        }

        for (si, stage) in stages.iter().enumerate() {
            for weak in &stage.classifiers {
                validate_tree(weak, features.len())
                    .map_err(|msg| CascadeError::Invalid(format!("stage {si}: {msg}")))?;
            }
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Load an OpenCV cascade XML file.
    pub fn load(path: &str) -> Result<Self, CascadeError> {
        if !Path::new(path).exists() {
            return Err(CascadeError::NotFound(path.to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path,
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?(cascade.window_width, cascade.window_height),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse an OpenCV cascade XML document in either layout.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = Document::parse(xml)?;
        let storage = doc.root_element();
        let root = elements(storage)
            .next()
            .ok_or_else(|| CascadeError::Invalid("empty opencv_storage".into()))?;

        if child(root, "stageType").is_some() {
            parse_boost_layout(root)
        } else if child(root, "size").is_some() {
            parse_legacy_layout(root)
        } else {
            Err(CascadeError::Invalid(format!(
                "unrecognized cascade layout under <{}>",
                root.tag_name().name()
            )))
        }
    }
}

fn validate_tree(weak: &WeakClassifier, num_features: usize) -> Result<(), String> {
    if weak.nodes.is_empty() {
        return Err("weak classifier without nodes".into());
    }
    for (i, node) in weak.nodes.iter().enumerate() {
        if node.feature >= num_features {
            return Err(format!("feature index {} out of range", node.feature));
        }
        for next in [node.left, node.right] {
            if next > 0 {
                // Children always point forward, so evaluation terminates.
                if next as usize <= i || next as usize >= weak.nodes.len() {
                    return Err(format!("node {i} has invalid child {next}"));
                }
            } else {
                let leaf = next.checked_neg().map(|l| l as usize);
                if leaf.map_or(true, |l| l >= weak.leaves.len()) {
                    return Err(format!("node {i} references missing leaf {next}"));
                }
            }
        }
    }
    Ok(())
}

/// `<cascade type_id="opencv-cascade-classifier">` with a shared `<features>` table.
fn parse_boost_layout(root: Node) -> Result<Cascade, CascadeError> {
    let stage_type = text(required(root, "stageType")?);
    let feature_type = text(required(root, "featureType")?);
    if stage_type != "BOOST" || feature_type != "HAAR" {
        return Err(CascadeError::Invalid(format!(
            "unsupported cascade {stage_type}/{feature_type}, need BOOST/HAAR"
        )));
    }

    let width: u32 = parse_one(required(root, "width")?)?;
    let height: u32 = parse_one(required(root, "height")?)?;

    let mut stages = Vec::new();
    for stage_node in elements(required(root, "stages")?) {
        let threshold: f32 = parse_one(required(stage_node, "stageThreshold")?)?;
        let mut classifiers = Vec::new();
        for weak_node in elements(required(stage_node, "weakClassifiers")?) {
            let internal: Vec<f32> = parse_list(required(weak_node, "internalNodes")?)?;
            let leaves: Vec<f32> = parse_list(required(weak_node, "leafValues")?)?;
            if internal.is_empty() || internal.len() % 4 != 0 {
                return Err(CascadeError::Invalid(format!(
                    "internalNodes has {} values, expected groups of 4",
                    internal.len()
                )));
            }
            let nodes = internal
                .chunks_exact(4)
                .map(|n| TreeNode {
                    left: n[0] as i32,
                    right: n[1] as i32,
                    feature: n[2] as usize,
                    threshold: n[3],
                })
                .collect();
            classifiers.push(WeakClassifier { nodes, leaves });
        }
        stages.push(Stage { threshold, classifiers });
    }

    let mut features = Vec::new();
    for feature_node in elements(required(root, "features")?) {
        features.push(parse_feature(feature_node)?);
    }

    Cascade::new(width, height, stages, features)
}

/// `<name type_id="opencv-haar-classifier">` with features inlined per node.
fn parse_legacy_layout(root: Node) -> Result<Cascade, CascadeError> {
    let size: Vec<u32> = parse_list(required(root, "size")?)?;
    let &[width, height] = size.as_slice() else {
        return Err(CascadeError::Invalid(format!("bad <size>: {size:?}")));
    };

    let mut features = Vec::new();
    let mut stages = Vec::new();

    for stage_node in elements(required(root, "stages")?) {
        let threshold: f32 = parse_one(required(stage_node, "stage_threshold")?)?;
        let mut classifiers = Vec::new();

        for tree_node in elements(required(stage_node, "trees")?) {
            let mut nodes = Vec::new();
            let mut leaves = Vec::new();

            for node in elements(tree_node) {
                features.push(parse_feature(required(node, "feature")?)?);
                let threshold: f32 = parse_one(required(node, "threshold")?)?;
                let left = legacy_child(node, "left_val", "left_node", &mut leaves)?;
                let right = legacy_child(node, "right_val", "right_node", &mut leaves)?;
                nodes.push(TreeNode {
                    feature: features.len() - 1,
                    threshold,
                    left,
                    right,
                });
            }
            classifiers.push(WeakClassifier { nodes, leaves });
        }
        stages.push(Stage { threshold, classifiers });
    }

    Cascade::new(width, height, stages, features)
}

/// Resolve a legacy `*_val` / `*_node` pair into the signed child encoding.
fn legacy_child(
    node: Node,
    val_tag: &str,
    node_tag: &str,
    leaves: &mut Vec<f32>,
) -> Result<i32, CascadeError> {
    if let Some(v) = child(node, val_tag) {
        leaves.push(parse_one(v)?);
        Ok(-((leaves.len() - 1) as i32))
    } else if let Some(n) = child(node, node_tag) {
        parse_one(n)
    } else {
        Err(CascadeError::Invalid(format!(
            "tree node has neither <{val_tag}> nor <{node_tag}>"
        )))
    }
}

fn parse_feature(node: Node) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = child(node, "tilted") {
        if text(tilted) != "0" {
            return Err(CascadeError::TiltedFeature);
        }
    }

    let mut rects = Vec::new();
    for rect_node in elements(required(node, "rects")?) {
        let v: Vec<f32> = parse_list(rect_node)?;
        let &[x, y, w, h, weight] = v.as_slice() else {
            return Err(CascadeError::Invalid(format!("bad rect: {:?}", text(rect_node))));
        };
        if x < 0.0 || y < 0.0 || w < 0.0 || h < 0.0 {
            return Err(CascadeError::Invalid(format!("negative rect: {v:?}")));
        }
        rects.push(WeightedRect {
            x: x as u32,
            y: y as u32,
            width: w as u32,
            height: h as u32,
            weight,
        });
    }
    Ok(HaarFeature { rects })
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|c| c.is_element())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name(name))
}

fn required<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, CascadeError> {
    child(node, name).ok_or_else(|| {
        CascadeError::Invalid(format!("<{}> is missing <{name}>", node.tag_name().name()))
    })
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_one<T: std::str::FromStr>(node: Node) -> Result<T, CascadeError> {
    let raw = text(node);
    raw.parse().map_err(|_| {
        CascadeError::Invalid(format!("<{}>: cannot parse {raw:?}", node.tag_name().name()))
    })
}

fn parse_list<T: std::str::FromStr>(node: Node) -> Result<Vec<T>, CascadeError> {
    text(node)
        .split_whitespace()
        .map(|tok| {
            tok.parse().map_err(|_| {
                CascadeError::Invalid(format!("<{}>: cannot parse {tok:?}", node.tag_name().name()))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<haarcascade_test type_id="opencv-haar-classifier">
  <size>24 24</size>
  <stages>
    <_>
      <!-- stage 0 -->
      <trees>
        <_>
          <!-- tree 0 -->
          <_>
            <!-- root node -->
            <feature>
              <rects>
                <_>6 4 12 9 -1.</_>
                <_>6 7 12 3 3.</_></rects>
              <tilted>0</tilted></feature>
            <threshold>-0.0315119996666908</threshold>
            <left_val>2.0875380039215088</left_val>
            <right_val>-2.2172100543975830</right_val></_></_>
        <_>
          <_>
            <feature>
              <rects>
                <_>0 0 24 24 -1.</_>
                <_>8 8 8 8 9.</_></rects>
              <tilted>0</tilted></feature>
            <threshold>0.01</threshold>
            <left_node>1</left_node>
            <right_val>0.5</right_val></_>
          <_>
            <feature>
              <rects>
                <_>0 0 12 24 -1.</_>
                <_>12 0 12 24 1.</_></rects>
              <tilted>0</tilted></feature>
            <threshold>0.2</threshold>
            <left_val>-0.25</left_val>
            <right_val>0.75</right_val></_></_></trees>
      <stage_threshold>-5.0425500869750977</stage_threshold>
      <parent>-1</parent>
      <next>-1</next></_></stages></haarcascade_test>
</opencv_storage>
"#;

    const BOOST_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams>
    <maxWeakCount>2</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>2</maxWeakCount>
      <stageThreshold>-1.2</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 -3.1511999666690826e-02</internalNodes>
          <leafValues>
            2.0875380039215088e+00 -2.2172100543975830e+00</leafValues></_>
        <_>
          <internalNodes>
            0 -1 1 1.2396000325679779e-02</internalNodes>
          <leafValues>
            -1.8633940219879150e+00 1.3272049427032471e+00</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          6 4 12 9 -1.</_>
        <_>
          6 7 12 3 3.</_></rects></_>
    <_>
      <rects>
        <_>
          6 4 12 7 -1.</_>
        <_>
          10 4 4 7 3.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    #[test]
    fn test_parse_legacy_layout() {
        let cascade = Cascade::from_xml(LEGACY_XML).unwrap();
        assert_eq!((cascade.window_width, cascade.window_height), (24, 24));
        assert_eq!(cascade.stages.len(), 1);
        assert_eq!(cascade.features.len(), 3);

        let stage = &cascade.stages[0];
        assert!((stage.threshold + 5.04255).abs() < 1e-4);
        assert_eq!(stage.classifiers.len(), 2);

        let stump = &stage.classifiers[0];
        assert_eq!(stump.nodes[0].left, 0);
        assert_eq!(stump.nodes[0].right, -1);
        assert_eq!(stump.leaves.len(), 2);
        assert_eq!(cascade.features[0].rects[1].weight, 3.0);

        // Two-node tree: root goes left to node 1, right to leaf 0.
        let tree = &stage.classifiers[1];
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(tree.nodes[0].left, 1);
        assert_eq!(tree.nodes[0].right, 0);
        assert_eq!(tree.leaves, vec![0.5, -0.25, 0.75]);
        assert_eq!(tree.nodes[1].left, -1);
        assert_eq!(tree.nodes[1].right, -2);
        assert_eq!(tree.nodes[1].feature, 2);
    }

    #[test]
    fn test_parse_boost_layout() {
        let cascade = Cascade::from_xml(BOOST_XML).unwrap();
        assert_eq!((cascade.window_width, cascade.window_height), (24, 24));
        assert_eq!(cascade.features.len(), 2);
        let stage = &cascade.stages[0];
        assert!((stage.threshold + 1.2).abs() < 1e-6);
        assert_eq!(stage.classifiers[1].nodes[0].feature, 1);
        assert!((stage.classifiers[1].leaves[1] - 1.327205).abs() < 1e-5);
        assert_eq!(
            cascade.features[1].rects[1],
            WeightedRect { x: 10, y: 4, width: 4, height: 7, weight: 3.0 }
        );
    }

    #[test]
    fn test_tilted_feature_rejected() {
        let xml = LEGACY_XML.replacen("<tilted>0</tilted>", "<tilted>1</tilted>", 1);
        assert!(matches!(Cascade::from_xml(&xml), Err(CascadeError::TiltedFeature)));
    }

    #[test]
    fn test_rect_outside_window_rejected() {
        let xml = LEGACY_XML.replace("<_>6 4 12 9 -1.</_>", "<_>20 4 12 9 -1.</_>");
        assert!(matches!(Cascade::from_xml(&xml), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_rect_coordinate_overflow_rejected() {
        let xml = LEGACY_XML.replace("<_>6 4 12 9 -1.</_>", "<_>4294967295 4 12 9 -1.</_>");
        assert!(matches!(Cascade::from_xml(&xml), Err(CascadeError::Invalid(_))));

        let features = vec![HaarFeature {
            rects: vec![WeightedRect { x: 1, y: u32::MAX, width: 1, height: 1, weight: 1.0 }],
        }];
        assert!(matches!(
            Cascade::new(24, 24, Vec::new(), features),
            Err(CascadeError::Invalid(_))
        ));
    }

    #[test]
    fn test_min_child_index_rejected() {
        let features = vec![HaarFeature {
            rects: vec![WeightedRect { x: 0, y: 0, width: 4, height: 4, weight: 1.0 }],
        }];
        let weak = WeakClassifier {
            nodes: vec![TreeNode { feature: 0, threshold: 0.0, left: i32::MIN, right: -1 }],
            leaves: vec![1.0, -1.0],
        };
        let stages = vec![Stage { threshold: 0.0, classifiers: vec![weak] }];
        assert!(matches!(
            Cascade::new(24, 24, stages, features),
            Err(CascadeError::Invalid(_))
        ));

        let xml = LEGACY_XML.replace("<left_node>1</left_node>", "<left_node>-2147483648</left_node>");
        assert!(matches!(Cascade::from_xml(&xml), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_unknown_layout_rejected() {
        let xml = "<opencv_storage><thing><foo>1</foo></thing></opencv_storage>";
        assert!(matches!(Cascade::from_xml(xml), Err(CascadeError::Invalid(_))));
    }

    #[test]
    fn test_backward_child_rejected() {
        let features = vec![HaarFeature {
            rects: vec![WeightedRect { x: 0, y: 0, width: 4, height: 4, weight: 1.0 }],
        }];
        let node = TreeNode { feature: 0, threshold: 0.0, left: 1, right: -1 };
        // node 1 points back at itself
        let weak = WeakClassifier {
            nodes: vec![node, node],
            leaves: vec![1.0, -1.0],
        };
        let stages = vec![Stage { threshold: 0.0, classifiers: vec![weak] }];
        assert!(Cascade::new(24, 24, stages, features).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Cascade::load("/nonexistent/cascade.xml"),
            Err(CascadeError::NotFound(_))
        ));
    }
}
