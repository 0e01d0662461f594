//! ArcFace recognizer via ONNX Runtime.
//!
//! Produces L2-normalised 512-d embeddings from aligned 112×112 RGB crops.
//! Both analysis packs (w600k_r50 and arcface_r100) share this input layout.

use crate::alignment::ALIGNED_SIZE;
use crate::encoder::EncoderError;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

pub struct ArcFaceRecognizer {
    session: Mutex<Session>,
}

impl ArcFaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Embed an aligned face crop. Crops of any other size are resized first.
    pub fn embed(&self, face: &RgbImage) -> Result<Embedding, EncoderError> {
        let input = if face.dimensions() == (ALIGNED_SIZE, ALIGNED_SIZE) {
            to_tensor(face)
        } else {
            to_tensor(&imageops::resize(face, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
        };

        let mut session = self
            .session
            .lock()
            .map_err(|e| EncoderError::InferenceFailed(format!("ArcFace session poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()).normalized())
    }
}

/// RGB crop → NCHW tensor with symmetric normalisation.
fn to_tensor(face: &RgbImage) -> Array4<f32> {
    let (w, h) = (face.width() as usize, face.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (p[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_tensor_shape() {
        let face = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
        assert_eq!(to_tensor(&face).shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_tensor_keeps_channels_apart() {
        let face = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 0, 128]));
        let t = to_tensor(&face);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((t[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx")).err().unwrap();
        assert!(matches!(err, EncoderError::ModelNotFound(_)));
    }
}
