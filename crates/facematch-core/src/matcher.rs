//! Query-vs-gallery scoring.

use crate::distance::Metric;
use crate::types::{Embedding, EncodingSet, MatchCandidate};
use serde::Serialize;
use std::cmp::Ordering;

/// Default tolerance for the 128-d Euclidean space.
pub const DEFAULT_TOLERANCE: f32 = 0.55;

/// Best match for one gallery photo in a multi-photo search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoMatch<K> {
    pub photo: K,
    /// Index of the best-matching face within the photo's EncodingSet.
    pub face_index: usize,
    pub confidence: f32,
}

/// Scores query embeddings against gallery embeddings.
#[derive(Debug, Clone, Copy)]
pub struct FaceMatcher {
    tolerance: f32,
}

impl Default for FaceMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl FaceMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Match every query embedding against every gallery embedding.
    ///
    /// A gallery face is a candidate when its distance to some query is at
    /// most the tolerance; its confidence is the best `1 - d / tolerance`
    /// across queries. Results are sorted by confidence descending, then by
    /// gallery index. Dimension disagreement yields an empty list and a
    /// warning rather than an error.
    pub fn find_matches(&self, query: &[Embedding], gallery: &[Embedding]) -> Vec<MatchCandidate> {
        let (Some(first_query), Some(first_gallery)) = (query.first(), gallery.first()) else {
            return Vec::new();
        };

        let dim = first_query.dim();
        let mismatch = query
            .iter()
            .chain(gallery.iter())
            .find(|e| e.dim() != dim);
        if let Some(other) = mismatch {
            tracing::warn!(
                query_dim = dim,
                gallery_dim = first_gallery.dim(),
                offending_dim = other.dim(),
                "encoding dimension mismatch, skipping gallery"
            );
            return Vec::new();
        }

        if self.tolerance <= 0.0 {
            tracing::warn!(tolerance = self.tolerance, "non-positive tolerance matches nothing");
            return Vec::new();
        }

        let metric = Metric::for_dim(dim);
        let mut best: Vec<Option<f32>> = vec![None; gallery.len()];

        for q in query {
            for (i, g) in gallery.iter().enumerate() {
                let d = metric.distance(&q.values, &g.values);
                if d <= self.tolerance {
                    let confidence = (1.0 - d / self.tolerance).clamp(0.0, 1.0);
                    let slot = &mut best[i];
                    *slot = Some(slot.map_or(confidence, |prev| prev.max(confidence)));
                }
            }
        }

        let mut candidates: Vec<MatchCandidate> = best
            .into_iter()
            .enumerate()
            .filter_map(|(index, c)| c.map(|confidence| MatchCandidate { index, confidence }))
            .collect();
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        candidates
    }

    /// Search many photos, returning the best face match per photo that
    /// matched at all, sorted by confidence descending.
    pub fn search<K: Clone>(&self, query: &[Embedding], galleries: &[(K, EncodingSet)]) -> Vec<PhotoMatch<K>> {
        let mut results: Vec<PhotoMatch<K>> = galleries
            .iter()
            .filter_map(|(photo, set)| {
                let best = self.find_matches(query, set.as_slice()).into_iter().next()?;
                Some(PhotoMatch {
                    photo: photo.clone(),
                    face_index: best.index,
                    confidence: best.confidence,
                })
            })
            .collect();
        results.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn at(dim: usize, value: f32) -> Embedding {
        let mut v = vec![0.0; dim];
        v[0] = value;
        Embedding::new(v)
    }

    #[test]
    fn test_only_close_faces_match() {
        let query = vec![at(128, 0.0)];
        let gallery = vec![at(128, 0.3), at(128, 0.6), at(128, 0.8)];
        let matches = FaceMatcher::new(0.55).find_matches(&query, &gallery);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].index, 0);
        assert!((matches[0].confidence - (1.0 - 0.3 / 0.55)).abs() < 1e-5);
        assert!((matches[0].confidence - 0.4545).abs() < 1e-3);
    }

    #[test]
    fn test_empty_gallery() {
        let matches = FaceMatcher::default().find_matches(&[at(128, 0.0)], &[]);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_empty_query() {
        let matches = FaceMatcher::default().find_matches(&[], &[at(128, 0.0)]);
        assert!(matches.is_empty());
    }

    /// Log buffer for a scoped subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Run `f`, returning its result and the warnings it logged.
    fn with_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        (out, logs)
    }

    #[test]
    fn test_dimension_mismatch_is_empty_and_logged() {
        let (matches, logs) = with_warnings(|| FaceMatcher::default().find_matches(&[at(128, 0.0)], &[at(512, 0.0)]));
        assert!(matches.is_empty());
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("encoding dimension mismatch"), "{logs}");
        assert!(logs.contains("gallery_dim=512"), "{logs}");
    }

    #[test]
    fn test_mixed_gallery_is_empty_and_logged() {
        let gallery = vec![at(128, 0.0), at(512, 0.0)];
        let (matches, logs) = with_warnings(|| FaceMatcher::default().find_matches(&[at(128, 0.0)], &gallery));
        assert!(matches.is_empty());
        assert!(logs.contains("offending_dim=512"), "{logs}");
    }

    #[test]
    fn test_matching_dimensions_log_nothing() {
        let (matches, logs) = with_warnings(|| FaceMatcher::default().find_matches(&[at(128, 0.0)], &[at(128, 0.1)]));
        assert_eq!(matches.len(), 1);
        assert!(logs.is_empty(), "{logs}");
    }

    #[test]
    fn test_confidence_zero_at_tolerance() {
        let matches = FaceMatcher::new(0.5).find_matches(&[at(128, 0.0)], &[at(128, 0.5)]);
        assert_eq!(matches.len(), 1);
        assert!(matches[0].confidence.abs() < 1e-6);
    }

    #[test]
    fn test_confidence_monotonic_and_bounded() {
        let gallery: Vec<Embedding> = (0..11).map(|i| at(128, i as f32 * 0.05)).collect();
        let matches = FaceMatcher::new(0.55).find_matches(&[at(128, 0.0)], &gallery);
        // Sorted by confidence → indices ascend as distance grows.
        for pair in matches.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
            assert!(pair[0].index < pair[1].index);
        }
        for m in &matches {
            assert!((0.0..=1.0).contains(&m.confidence));
        }
        assert!((matches[0].confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_max_over_queries() {
        let query = vec![at(128, 0.0), at(128, 0.4)];
        let gallery = vec![at(128, 0.45)];
        let matches = FaceMatcher::new(0.55).find_matches(&query, &gallery);
        assert_eq!(matches.len(), 1);
        // Second query is 0.05 away, beating the first at 0.45.
        assert!((matches[0].confidence - (1.0 - 0.05 / 0.55)).abs() < 1e-4);
    }

    #[test]
    fn test_ties_broken_by_index() {
        let gallery = vec![at(128, 0.2), at(128, -0.2), at(128, 0.2)];
        let matches = FaceMatcher::new(0.55).find_matches(&[at(128, 0.0)], &gallery);
        let indices: Vec<usize> = matches.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_cosine_matching_512() {
        let mut other = vec![0.0; 512];
        other[1] = 1.0;
        let gallery = vec![Embedding::new(other), at(512, 2.0)];
        let matches = FaceMatcher::new(0.4).find_matches(&[at(512, 1.0)], &gallery);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].index, 1);
        assert!((matches[0].confidence - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_search_skips_mismatched_photos() {
        let galleries = vec![
            ("a", EncodingSet::new(vec![at(128, 0.5)]).unwrap()),
            ("b", EncodingSet::new(vec![at(512, 0.0)]).unwrap()),
            ("c", EncodingSet::new(vec![at(128, 0.9), at(128, 0.1)]).unwrap()),
            ("d", EncodingSet::default()),
        ];
        let results = FaceMatcher::new(0.55).search(&[at(128, 0.0)], &galleries);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].photo, "c");
        assert_eq!(results[0].face_index, 1);
        assert_eq!(results[1].photo, "a");
    }
}
