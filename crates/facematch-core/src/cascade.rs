//! Cascade detector (Haar tier) backed by the `rustface` SeetaFace engine.
//!
//! Tuned for small faces: a fine pyramid and the minimum window the engine
//! accepts. It ignores the upsample factor.

use crate::detector::{DetectOptions, DetectorError, DetectorFamily, FaceDetector};
use crate::types::BoundingBox;
use image::imageops;
use image::RgbImage;
use std::fs::File;
use std::io::BufReader;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

const CASCADE_MIN_FACE_SIZE: u32 = 20;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

pub struct CascadeDetector {
    model: rustface::Model,
}

impl CascadeDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let model = rustface::read_model(BufReader::new(File::open(model_path)?))?;
        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");
        Ok(Self { model })
    }
}

impl FaceDetector for CascadeDetector {
    fn family(&self) -> DetectorFamily {
        DetectorFamily::Haar
    }

    fn detect(&self, image: &RgbImage, options: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width < CASCADE_MIN_FACE_SIZE || height < CASCADE_MIN_FACE_SIZE {
            return Ok(Vec::new());
        }
        let gray = imageops::grayscale(image);

        // The engine panics on images it considers illegal; keep that inside
        // this detector.
        let faces = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut detector = rustface::create_detector_with_model(self.model.clone());
            detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
            detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
            detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
            detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);
            detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height))
        }))
        .map_err(|_| DetectorError::InferenceFailed("cascade detector panicked".into()))?;

        Ok(faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                BoundingBox::from_xywh(bbox.x(), bbox.y(), bbox.width(), bbox.height(), width, height)
            })
            .take(options.max_faces)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_model() {
        let err = CascadeDetector::load(Path::new("/nonexistent/seeta_fd_frontal_v1.0.bin")).err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn test_load_corrupt_model_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeta_fd_frontal_v1.0.bin");
        std::fs::write(&path, [0u8; 3]).unwrap();
        assert!(CascadeDetector::load(&path).is_err());
    }
}
