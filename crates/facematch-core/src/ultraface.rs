//! Single-shot UltraFace detectors backing the fast (HOG-tier) and heavier
//! (CNN-tier) classical families. Both are scale sensitive: the upsample
//! factor adds a tiled search so small faces reach model resolution.

use crate::detector::{
    detect_tiled, letterbox, nms, to_boxes, DetectOptions, DetectorError, DetectorFamily, FaceDetector,
    RawDetection,
};
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

/// Input size of the RFB-320 export used for the fast tier.
pub const FAST_INPUT: (u32, u32) = (320, 240);
/// Input size of the RFB-640 export used for the CNN tier.
pub const ACCURATE_INPUT: (u32, u32) = (640, 480);

pub struct UltraFaceDetector {
    family: DetectorFamily,
    session: Mutex<Session>,
    input_width: u32,
    input_height: u32,
}

impl UltraFaceDetector {
    pub fn load(model_path: &Path, family: DetectorFamily, input: (u32, u32)) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            detector = %family,
            width = input.0,
            height = input.1,
            "loaded UltraFace model"
        );

        Ok(Self {
            family,
            session: Mutex::new(session),
            input_width: input.0,
            input_height: input.1,
        })
    }

    fn detect_region(&self, region: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        let fill = Rgb([ULTRAFACE_MEAN as u8; 3]);
        let (canvas, letterbox) = letterbox(region, self.input_width, self.input_height, fill);
        let input = to_tensor(&canvas);

        let mut session = self
            .session
            .lock()
            .map_err(|e| DetectorError::InferenceFailed(format!("UltraFace session poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut scores: Option<&[f32]> = None;
        let mut boxes: Option<&[f32]> = None;
        for i in 0..outputs.len() {
            let (shape, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("output {i}: {e}")))?;
            match shape.last().copied() {
                Some(2) => scores = Some(data),
                Some(4) => boxes = Some(data),
                _ => {}
            }
        }
        let (Some(scores), Some(boxes)) = (scores, boxes) else {
            return Err(DetectorError::InferenceFailed(
                "UltraFace model must expose scores (…×2) and boxes (…×4) outputs".into(),
            ));
        };

        let (w, h) = (self.input_width as f32, self.input_height as f32);
        let dets = decode(scores, boxes)
            .into_iter()
            .map(|d| {
                let (x1, y1) = letterbox.unmap(d.x1 * w, d.y1 * h);
                let (x2, y2) = letterbox.unmap(d.x2 * w, d.y2 * h);
                RawDetection { x1, y1, x2, y2, ..d }
            })
            .collect();
        Ok(nms(dets, ULTRAFACE_NMS_THRESHOLD))
    }
}

impl FaceDetector for UltraFaceDetector {
    fn family(&self) -> DetectorFamily {
        self.family
    }

    fn detect(&self, image: &RgbImage, options: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError> {
        let dets = detect_tiled(image, options.upsample, |region| self.detect_region(region))?;
        Ok(to_boxes(&dets, image.width(), image.height(), options.max_faces))
    }
}

/// Decode normalised corner boxes whose face-class score clears the threshold.
fn decode(scores: &[f32], boxes: &[f32]) -> Vec<RawDetection> {
    scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(s, _)| s[1] > ULTRAFACE_CONFIDENCE_THRESHOLD)
        .map(|(s, b)| RawDetection {
            x1: b[0],
            y1: b[1],
            x2: b[2],
            y2: b[3],
            score: s[1],
            landmarks: None,
        })
        .collect()
}

fn to_tensor(canvas: &RgbImage) -> Array4<f32> {
    let (w, h) = (canvas.width() as usize, canvas.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (p[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }
    tensor
}
