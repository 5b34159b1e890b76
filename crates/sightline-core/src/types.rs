use crate::gallery::Gallery;
use serde::{Deserialize, Serialize};

/// Euclidean acceptance threshold used when the embedding provider does not
/// recommend one of its own.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Label given to faces that do not match any gallery entry.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Axis-aligned bounding box for a detected face, with optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Multiply every coordinate (and landmark) by `factor`.
    ///
    /// Used to map boxes found on a downsampled frame back onto the
    /// full-resolution frame.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }
}

/// Face embedding vector. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// False if any value is NaN or infinite. JSON has no encoding for those.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One detected face and its embedding, as produced by an embedding provider.
#[derive(Debug, Clone)]
pub struct FaceEncoding {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Label of the matched entry (if any).
    pub label: Option<String>,
    /// Index of the matched entry (if any).
    pub index: Option<usize>,
    /// Distance to the nearest entry; `None` for an empty gallery.
    pub distance: Option<f32>,
}

impl MatchResult {
    fn unmatched(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            label: None,
            index: None,
            distance,
        }
    }

    /// Label to display for this result.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for classifying a query embedding against the gallery.
///
/// Recognition and enrollment de-duplication share one acceptance rule:
/// `is_duplicate` is defined in terms of `classify`.
pub trait Matcher {
    fn classify(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;

    fn is_duplicate(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> bool {
        self.classify(query, gallery, threshold).matched
    }
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Ties on the minimum distance resolve to the lowest index.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn classify(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                tracing::warn!(
                    index = i,
                    label = %entry.label,
                    entry_dim = entry.embedding.dim(),
                    query_dim = query.dim(),
                    "embedding length mismatch; entry not compared"
                );
                continue;
            }
            let dist = query.euclidean_distance(&entry.embedding);
            // Strict comparison keeps the first of several equal minima.
            let closer = match best {
                None => true,
                Some((_, best_dist)) => dist < best_dist,
            };
            if closer {
                best = Some((i, dist));
            }
        }

        match best {
            Some((idx, dist)) if dist <= threshold => MatchResult {
                matched: true,
                label: Some(gallery[idx].label.clone()),
                index: Some(idx),
                distance: Some(dist),
            },
            Some((_, dist)) => MatchResult::unmatched(Some(dist)),
            None => MatchResult::unmatched(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn gallery(entries: &[(&str, &[f32])]) -> Gallery {
        let mut g = Gallery::new();
        for (label, values) in entries {
            g.push(GalleryEntry::new(*label, emb(values)));
        }
        g
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_bbox_scaled() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: Some([(1.0, 2.0); 5]),
        };
        let scaled = bbox.scaled(4.0);
        assert_eq!(scaled.x, 40.0);
        assert_eq!(scaled.y, 80.0);
        assert_eq!(scaled.width, 120.0);
        assert_eq!(scaled.height, 160.0);
        assert_eq!(scaled.confidence, 0.9);
        assert_eq!(scaled.landmarks, Some([(4.0, 8.0); 5]));
    }

    #[test]
    fn test_classify_empty_gallery() {
        let result = EuclideanMatcher.classify(&emb(&[1.0, 0.0]), &Gallery::new(), 0.6);
        assert!(!result.matched);
        assert_eq!(result.label, None);
        assert_eq!(result.distance, None);
        assert_eq!(result.display_label(), UNKNOWN_LABEL);
    }

    #[test]
    fn test_classify_picks_nearest_within_threshold() {
        let g = gallery(&[
            ("far", &[5.0, 5.0]),
            ("near", &[1.0, 0.1]),
            ("mid", &[1.5, 0.0]),
        ]);
        let result = EuclideanMatcher.classify(&emb(&[1.0, 0.0]), &g, 0.6);
        assert!(result.matched);
        assert_eq!(result.label.as_deref(), Some("near"));
        assert_eq!(result.index, Some(1));
        assert!((result.distance.unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_classify_nearest_outside_threshold() {
        let g = gallery(&[("other", &[2.0, 0.0])]);
        let result = EuclideanMatcher.classify(&emb(&[0.0, 0.0]), &g, 0.6);
        assert!(!result.matched);
        assert_eq!(result.label, None);
        assert!((result.distance.unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_classify_threshold_is_inclusive() {
        let g = gallery(&[("edge", &[0.5, 0.0])]);
        let result = EuclideanMatcher.classify(&emb(&[0.0, 0.0]), &g, 0.5);
        assert!(result.matched);
    }

    #[test]
    fn test_classify_tie_breaks_to_lowest_index() {
        let g = gallery(&[
            ("decoy", &[9.0, 9.0]),
            ("left", &[-0.2, 0.0]),
            ("right", &[0.2, 0.0]),
        ]);
        let query = emb(&[0.0, 0.0]);
        for _ in 0..10 {
            let result = EuclideanMatcher.classify(&query, &g, 0.6);
            assert_eq!(result.label.as_deref(), Some("left"));
            assert_eq!(result.index, Some(1));
        }
    }

    #[test]
    fn test_classify_skips_mismatched_lengths() {
        let g = gallery(&[("Known (1)", &[0.0, 0.0])]);
        let result = EuclideanMatcher.classify(&emb(&[0.0, 0.0, 5.0, 5.0]), &g, 0.6);
        assert!(!result.matched);
        assert_eq!(result.label, None);
        assert_eq!(result.distance, None);

        // Comparable entries still win when mixed with stale ones.
        let mixed = gallery(&[("stale", &[0.0, 0.0]), ("fresh", &[0.0, 0.0, 5.0, 5.1])]);
        let result = EuclideanMatcher.classify(&emb(&[0.0, 0.0, 5.0, 5.0]), &mixed, 0.6);
        assert_eq!(result.label.as_deref(), Some("fresh"));
        assert_eq!(result.index, Some(1));
    }

    #[test]
    fn test_is_duplicate_uses_recognition_rule() {
        let g = gallery(&[("a", &[0.0, 0.0]), ("b", &[1.0, 1.0])]);
        assert!(EuclideanMatcher.is_duplicate(&emb(&[0.9, 1.0]), &g, 0.6));
        assert!(!EuclideanMatcher.is_duplicate(&emb(&[3.0, 3.0]), &g, 0.6));
        assert!(!EuclideanMatcher.is_duplicate(&emb(&[0.0, 0.0]), &Gallery::new(), 0.6));
    }
}
