//! RetinaFace region detector via ONNX Runtime.
//!
//! Anchor-based decoding over three feature-pyramid levels. The model reports
//! centre-form offsets against prior boxes; they are decoded to corners and
//! mapped back through the letterbox before being translated to canonical
//! `(top, right, bottom, left)` boxes.

use crate::detector::{
    letterbox, nms, to_boxes, DetectOptions, DetectorError, DetectorFamily, FaceDetector, LetterboxInfo,
    RawDetection,
};
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const RETINA_INPUT_SIZE: u32 = 640;
/// Per-channel BGR means subtracted from the input.
const RETINA_MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];
const RETINA_MIN_SIZES: [[f32; 2]; 3] = [[16.0, 32.0], [64.0, 128.0], [256.0, 512.0]];
const RETINA_STEPS: [u32; 3] = [8, 16, 32];
const RETINA_VARIANCE: [f32; 2] = [0.1, 0.2];
const RETINA_CONFIDENCE_THRESHOLD: f32 = 0.6;
const RETINA_NMS_THRESHOLD: f32 = 0.4;

/// Prior box in normalised centre form: (cx, cy, w, h).
type Prior = [f32; 4];

pub struct RetinaFaceDetector {
    session: Mutex<Session>,
    priors: Vec<Prior>,
}

impl RetinaFaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded RetinaFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
            priors: priors(RETINA_INPUT_SIZE, RETINA_INPUT_SIZE),
        })
    }

    fn detect_raw(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        let (canvas, letterbox) = letterbox(image, RETINA_INPUT_SIZE, RETINA_INPUT_SIZE, Rgb([123, 117, 104]));
        let input = to_tensor(&canvas);

        let mut session = self
            .session
            .lock()
            .map_err(|e| DetectorError::InferenceFailed(format!("RetinaFace session poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut loc: Option<&[f32]> = None;
        let mut conf: Option<&[f32]> = None;
        let mut landms: Option<&[f32]> = None;
        for i in 0..outputs.len() {
            let (shape, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("output {i}: {e}")))?;
            match shape.last().copied() {
                Some(4) => loc = Some(data),
                Some(2) => conf = Some(data),
                Some(10) => landms = Some(data),
                other => tracing::debug!(output = i, last_dim = ?other, "ignoring RetinaFace output"),
            }
        }

        let (Some(loc), Some(conf)) = (loc, conf) else {
            return Err(DetectorError::InferenceFailed(
                "RetinaFace model must expose loc (…×4) and conf (…×2) outputs".into(),
            ));
        };

        let dets = decode(&self.priors, loc, conf, landms, RETINA_INPUT_SIZE as f32, &letterbox);
        Ok(nms(dets, RETINA_NMS_THRESHOLD))
    }
}

impl FaceDetector for RetinaFaceDetector {
    fn family(&self) -> DetectorFamily {
        DetectorFamily::RetinaFace
    }

    fn detect(&self, image: &RgbImage, options: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError> {
        let dets = self.detect_raw(image)?;
        Ok(to_boxes(&dets, image.width(), image.height(), options.max_faces))
    }
}

/// Generate prior boxes for a `width × height` input.
fn priors(width: u32, height: u32) -> Vec<Prior> {
    let mut out = Vec::new();
    for (step, min_sizes) in RETINA_STEPS.iter().zip(RETINA_MIN_SIZES.iter()) {
        let rows = height.div_ceil(*step);
        let cols = width.div_ceil(*step);
        for i in 0..rows {
            for j in 0..cols {
                for &min_size in min_sizes {
                    out.push([
                        (j as f32 + 0.5) * *step as f32 / width as f32,
                        (i as f32 + 0.5) * *step as f32 / height as f32,
                        min_size / width as f32,
                        min_size / height as f32,
                    ]);
                }
            }
        }
    }
    out
}

fn decode(
    priors: &[Prior],
    loc: &[f32],
    conf: &[f32],
    landms: Option<&[f32]>,
    input_size: f32,
    letterbox: &LetterboxInfo,
) -> Vec<RawDetection> {
    let [v0, v1] = RETINA_VARIANCE;
    let mut detections = Vec::new();

    for (i, p) in priors.iter().enumerate() {
        let Some(&score) = conf.get(i * 2 + 1) else {
            break;
        };
        if score <= RETINA_CONFIDENCE_THRESHOLD || i * 4 + 3 >= loc.len() {
            continue;
        }

        let l = &loc[i * 4..i * 4 + 4];
        let cx = p[0] + l[0] * v0 * p[2];
        let cy = p[1] + l[1] * v0 * p[3];
        let w = p[2] * (l[2] * v1).exp();
        let h = p[3] * (l[3] * v1).exp();

        let (x1, y1) = letterbox.unmap((cx - w / 2.0) * input_size, (cy - h / 2.0) * input_size);
        let (x2, y2) = letterbox.unmap((cx + w / 2.0) * input_size, (cy + h / 2.0) * input_size);

        let landmarks = landms.filter(|lm| i * 10 + 9 < lm.len()).map(|lm| {
            std::array::from_fn(|k| {
                letterbox.unmap(
                    (p[0] + lm[i * 10 + k * 2] * v0 * p[2]) * input_size,
                    (p[1] + lm[i * 10 + k * 2 + 1] * v0 * p[3]) * input_size,
                )
            })
        });

        detections.push(RawDetection {
            x1,
            y1,
            x2,
            y2,
            score,
            landmarks,
        });
    }

    detections
}

/// BGR mean-subtracted NCHW tensor.
fn to_tensor(canvas: &RgbImage) -> Array4<f32> {
    let (w, h) = (canvas.width() as usize, canvas.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in canvas.enumerate_pixels() {
        let bgr = [p[2], p[1], p[0]];
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = bgr[c] as f32 - RETINA_MEAN_BGR[c];
        }
    }
    tensor
}
