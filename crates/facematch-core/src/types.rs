use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Face location on the source image's pixel grid, stored as
/// `(top, right, bottom, left)` edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BoundingBox {
    pub const fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self { top, right, bottom, left }
    }

    /// Build a box from corner coordinates `(x1, y1, x2, y2)`, clamped to a
    /// `width × height` image. Returns `None` when the clamped box is empty.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Option<Self> {
        let clamp_x = |v: f32| v.round().clamp(0.0, width as f32) as i32;
        let clamp_y = |v: f32| v.round().clamp(0.0, height as f32) as i32;
        let bbox = Self {
            top: clamp_y(y1),
            right: clamp_x(x2),
            bottom: clamp_y(y2),
            left: clamp_x(x1),
        };
        bbox.is_valid().then_some(bbox)
    }

    /// Build a box from `(x, y, width, height)` as reported by cascade detectors.
    pub fn from_xywh(x: i32, y: i32, w: u32, h: u32, width: u32, height: u32) -> Option<Self> {
        Self::from_corners(x as f32, y as f32, (x + w as i32) as f32, (y + h as i32) as f32, width, height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Area in pixels; zero for inverted boxes.
    pub fn area(&self) -> i64 {
        (self.width().max(0) as i64) * (self.height().max(0) as i64)
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    /// Whether all edges lie within a `width × height` image.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.is_valid()
            && self.left >= 0
            && self.top >= 0
            && self.right <= width as i32
            && self.bottom <= height as i32
    }

    /// Grow the box by `fraction` of its size on every side, clamped to the image.
    pub fn expand(&self, fraction: f32, width: u32, height: u32) -> Option<Self> {
        let dx = self.width() as f32 * fraction;
        let dy = self.height() as f32 * fraction;
        Self::from_corners(
            self.left as f32 - dx,
            self.top as f32 - dy,
            self.right as f32 + dx,
            self.bottom as f32 + dy,
            width,
            height,
        )
    }

    /// Map a box found in a crop whose origin is `(left, top)` back into the parent image.
    pub fn offset(&self, left: i32, top: i32) -> Self {
        Self {
            top: self.top + top,
            right: self.right + left,
            bottom: self.bottom + top,
            left: self.left + left,
        }
    }
}

/// Face embedding vector: 128-dimensional for the classical encoder,
/// 512-dimensional for the ArcFace service encoders.
///
/// Serialises as a bare array of floats.
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

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Return an L2-normalised copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Self {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Self::new(self.values.iter().map(|x| x / norm).collect())
        } else {
            self.clone()
        }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingSetError {
    #[error("mixed embedding dimensions in one set: {first} and {other}")]
    MixedDimensions { first: usize, other: usize },
    #[error("empty embedding vector at index {0}")]
    EmptyEmbedding(usize),
}

/// Embeddings for one image, index-aligned with its merged face list.
///
/// Persisted as nested float arrays; the dimensionality is implied by the
/// vector length, so construction rejects sets that mix lengths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Embedding>", into = "Vec<Embedding>")]
pub struct EncodingSet {
    embeddings: Vec<Embedding>,
}

impl EncodingSet {
    pub fn new(embeddings: Vec<Embedding>) -> Result<Self, EncodingSetError> {
        if let Some(first) = embeddings.first() {
            for (i, e) in embeddings.iter().enumerate() {
                if e.dim() == 0 {
                    return Err(EncodingSetError::EmptyEmbedding(i));
                }
                if e.dim() != first.dim() {
                    return Err(EncodingSetError::MixedDimensions {
                        first: first.dim(),
                        other: e.dim(),
                    });
                }
            }
        }
        Ok(Self { embeddings })
    }

    /// Dimensionality shared by every member, `None` for an empty set.
    pub fn dim(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dim)
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Embedding> {
        self.embeddings.iter()
    }

    pub fn as_slice(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn into_inner(self) -> Vec<Embedding> {
        self.embeddings
    }
}

impl TryFrom<Vec<Embedding>> for EncodingSet {
    type Error = EncodingSetError;

    fn try_from(embeddings: Vec<Embedding>) -> Result<Self, Self::Error> {
        Self::new(embeddings)
    }
}

impl From<EncodingSet> for Vec<Embedding> {
    fn from(set: EncodingSet) -> Self {
        set.embeddings
    }
}

/// A gallery face that matched at least one query embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Index of the face within the gallery's EncodingSet.
    pub index: usize,
    /// Confidence in [0, 1]; 1 means identical embeddings.
    pub confidence: f32,
}
