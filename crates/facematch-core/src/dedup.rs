//! Embedding-space deduplication.
//!
//! Box merging can still admit two boxes for one face when detectors
//! disagree sharply on its extent; their embeddings then land almost on top
//! of each other and are collapsed here.

use crate::distance;
use crate::types::Embedding;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.98;

/// Keep the first embedding, then keep each later embedding only if its
/// distance to every kept embedding is strictly greater than
/// `1 - similarity_threshold`.
pub fn dedup(embeddings: Vec<Embedding>, similarity_threshold: f32) -> Vec<Embedding> {
    let min_distance = 1.0 - similarity_threshold;
    let mut unique: Vec<Embedding> = Vec::with_capacity(embeddings.len());

    for candidate in embeddings {
        let nearest = unique
            .iter()
            .filter_map(|kept| distance::distance(kept, &candidate))
            .fold(f32::INFINITY, f32::min);
        if nearest > min_distance {
            unique.push(candidate);
        } else {
            tracing::debug!(nearest, "dropping duplicate embedding");
        }
    }

    unique
}
