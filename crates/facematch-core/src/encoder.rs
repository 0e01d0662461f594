//! Encoder capability: one embedding per face box, order preserving.

use crate::detector::DetectorError;
use crate::types::{BoundingBox, Embedding};
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("face box {0:?} lies outside the image")]
    InvalidBox(BoundingBox),
    #[error("face detection inside crop failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFamily {
    /// 128-d ResNet encoder compared with Euclidean distance.
    Classical,
    /// ArcFace half of the InsightFace analysis pack.
    InsightFace,
    /// ArcFace half of the DeepFace analysis pack.
    DeepFace,
}

impl EncoderFamily {
    pub fn name(self) -> &'static str {
        match self {
            EncoderFamily::Classical => "classical",
            EncoderFamily::InsightFace => "insightface",
            EncoderFamily::DeepFace => "deepface",
        }
    }

    pub fn dim(self) -> usize {
        match self {
            EncoderFamily::Classical => crate::distance::CLASSICAL_DIM,
            EncoderFamily::InsightFace | EncoderFamily::DeepFace => 512,
        }
    }
}

impl fmt::Display for EncoderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// "Embedding from image + box" capability.
///
/// Returns exactly one embedding per input box, in input order. Any failure
/// fails the whole call; callers never see a partial list.
pub trait FaceEncoder: Send + Sync {
    fn family(&self) -> EncoderFamily;

    fn encode(&self, image: &RgbImage, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError>;
}

/// Cut `bbox` grown by `margin` (fraction of the box size per side) out of
/// `image`. Returns the crop and the box of the crop in image coordinates.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox, margin: f32) -> Result<(RgbImage, BoundingBox), EncoderError> {
    let (width, height) = image.dimensions();
    if !bbox.fits(width, height) {
        return Err(EncoderError::InvalidBox(*bbox));
    }
    let region = bbox.expand(margin, width, height).ok_or(EncoderError::InvalidBox(*bbox))?;
    let crop = imageops::crop_imm(
        image,
        region.left as u32,
        region.top as u32,
        region.width() as u32,
        region.height() as u32,
    )
    .to_image();
    Ok((crop, region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_family_dims() {
        assert_eq!(EncoderFamily::Classical.dim(), 128);
        assert_eq!(EncoderFamily::InsightFace.dim(), 512);
        assert_eq!(EncoderFamily::DeepFace.dim(), 512);
    }

    #[test]
    fn test_crop_face_with_margin() {
        let mut image = RgbImage::new(100, 100);
        image.put_pixel(20, 20, Rgb([9, 9, 9]));
        let (crop, region) = crop_face(&image, &BoundingBox::new(20, 40, 40, 20), 0.25).unwrap();
        assert_eq!(region, BoundingBox::new(15, 45, 45, 15));
        assert_eq!(crop.dimensions(), (30, 30));
        assert_eq!(*crop.get_pixel(5, 5), Rgb([9, 9, 9]));
    }

    #[test]
    fn test_crop_face_clamps_margin_at_border() {
        let image = RgbImage::new(50, 50);
        let (crop, region) = crop_face(&image, &BoundingBox::new(0, 20, 20, 0), 0.5).unwrap();
        assert_eq!(region, BoundingBox::new(0, 30, 30, 0));
        assert_eq!(crop.dimensions(), (30, 30));
    }

    #[test]
    fn test_crop_face_rejects_box_outside_image() {
        let image = RgbImage::new(50, 50);
        let err = crop_face(&image, &BoundingBox::new(40, 80, 60, 30), 0.0).unwrap_err();
        assert!(matches!(err, EncoderError::InvalidBox(_)));
    }
}
