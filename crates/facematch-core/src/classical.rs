//! Classical 128-d face encoder: the ResNet-34 metric network exported to
//! ONNX, fed 150×150 face chips and compared with Euclidean distance.
//!
//! Jittering embeds several randomly perturbed copies of each chip (small
//! scale and shift changes, horizontal flips) and averages the results.

use crate::distance::CLASSICAL_DIM;
use crate::encoder::{crop_face, EncoderError, EncoderFamily, FaceEncoder};
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const CHIP_SIZE: u32 = 150;
/// Context kept around the detector box when cutting the chip.
const CHIP_MARGIN: f32 = 0.25;
const CHIP_MEAN: [f32; 3] = [122.782, 117.001, 104.298];
const CHIP_SCALE: f32 = 256.0;
const JITTER_MAX_SCALE: f32 = 0.1;
const JITTER_MAX_SHIFT: f32 = 0.05;

pub const DEFAULT_JITTERS: u32 = 5;
pub const ENSEMBLE_JITTERS: u32 = 10;
/// Upper bound for the cascade-only pipeline.
pub const CASCADE_MAX_JITTERS: u32 = 5;

/// Encoder for the classical family. Cloning shares the loaded session.
#[derive(Clone)]
pub struct ClassicalEncoder {
    session: Arc<Mutex<Session>>,
    rng: Arc<Mutex<StdRng>>,
    jitters: u32,
}

impl ClassicalEncoder {
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded classical face encoder");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            jitters: DEFAULT_JITTERS,
        })
    }

    /// Same model, different jitter count. At least one pass always runs.
    pub fn with_jitters(&self, jitters: u32) -> Self {
        Self {
            jitters: jitters.max(1),
            ..self.clone()
        }
    }

    pub fn jitters(&self) -> u32 {
        self.jitters
    }

    fn embed_chip(&self, chip: &RgbImage) -> Result<Vec<f32>, EncoderError> {
        let input = to_tensor(chip);
        let mut session = self
            .session
            .lock()
            .map_err(|e| EncoderError::InferenceFailed(format!("encoder session poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;
        if raw.len() != CLASSICAL_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {CLASSICAL_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }

    fn encode_one(&self, image: &RgbImage, bbox: &BoundingBox) -> Result<Embedding, EncoderError> {
        let (crop, _) = crop_face(image, bbox, CHIP_MARGIN)?;
        let chip = imageops::resize(&crop, CHIP_SIZE, CHIP_SIZE, FilterType::Lanczos3);

        let mut sum = self.embed_chip(&chip)?;
        for _ in 1..self.jitters {
            let params = {
                let mut rng = self
                    .rng
                    .lock()
                    .map_err(|e| EncoderError::InferenceFailed(format!("jitter rng poisoned: {e}")))?;
                JitterParams::random(&mut *rng)
            };
            let values = self.embed_chip(&jitter(&chip, &params))?;
            for (acc, v) in sum.iter_mut().zip(values) {
                *acc += v;
            }
        }

        let n = self.jitters as f32;
        Ok(Embedding::new(sum.into_iter().map(|v| v / n).collect()))
    }
}

impl FaceEncoder for ClassicalEncoder {
    fn family(&self) -> EncoderFamily {
        EncoderFamily::Classical
    }

    fn encode(&self, image: &RgbImage, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError> {
        boxes.iter().map(|b| self.encode_one(image, b)).collect()
    }
}

/// One random perturbation of a chip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterParams {
    /// Zoom factor applied around the chip centre.
    pub scale: f32,
    /// Shift as a fraction of the chip size.
    pub shift_x: f32,
    pub shift_y: f32,
    pub flip: bool,
}

impl JitterParams {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            scale: rng.gen_range(1.0 - JITTER_MAX_SCALE..=1.0 + JITTER_MAX_SCALE),
            shift_x: rng.gen_range(-JITTER_MAX_SHIFT..=JITTER_MAX_SHIFT),
            shift_y: rng.gen_range(-JITTER_MAX_SHIFT..=JITTER_MAX_SHIFT),
            flip: rng.gen_bool(0.5),
        }
    }
}

/// Re-sample `chip` through a zoom/shift window, optionally mirrored.
/// The output keeps the chip's size; the window is clamped to the chip.
pub fn jitter(chip: &RgbImage, params: &JitterParams) -> RgbImage {
    let (w, h) = chip.dimensions();
    let win_w = ((w as f32 / params.scale).round() as u32).clamp(1, w);
    let win_h = ((h as f32 / params.scale).round() as u32).clamp(1, h);
    let cx = w as f32 / 2.0 + params.shift_x * w as f32;
    let cy = h as f32 / 2.0 + params.shift_y * h as f32;
    let x = (cx - win_w as f32 / 2.0).round().clamp(0.0, (w - win_w) as f32) as u32;
    let y = (cy - win_h as f32 / 2.0).round().clamp(0.0, (h - win_h) as f32) as u32;

    let window = imageops::crop_imm(chip, x, y, win_w, win_h).to_image();
    let mut out = if (win_w, win_h) == (w, h) {
        window
    } else {
        imageops::resize(&window, w, h, FilterType::Triangle)
    };
    if params.flip {
        imageops::flip_horizontal_in_place(&mut out);
    }
    out
}

fn to_tensor(chip: &RgbImage) -> Array4<f32> {
    let (w, h) = (chip.width() as usize, chip.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in chip.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (p[c] as f32 - CHIP_MEAN[c]) / CHIP_SCALE;
        }
    }
    tensor
}
