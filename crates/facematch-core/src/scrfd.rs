//! SCRFD face detector via ONNX Runtime.
//!
//! Detection half of the InsightFace-style analysis packs: 3-stride
//! anchor-free decoding with five-point landmarks, followed by NMS.

use crate::detector::{letterbox, nms, DetectorError, LetterboxInfo, RawDetection};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const OUTPUTS_PER_STRIDE: usize = 3;

/// Positions of one stride's tensors in the session outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    scores: usize,
    boxes: usize,
    landmarks: usize,
}

/// Borrowed tensor data for one stride level.
struct StrideTensors<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

pub struct ScrfdDetector {
    session: Mutex<Session>,
    layout: [StrideOutputs; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let expected = STRIDES.len() * OUTPUTS_PER_STRIDE;
        if names.len() < expected {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD export has {} outputs, need {expected} (score, bbox and kps per stride)",
                names.len()
            )));
        }

        let layout = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?layout, "loaded SCRFD model");

        Ok(Self {
            session: Mutex::new(session),
            layout,
        })
    }

    /// Faces with landmarks in source-image coordinates, best first.
    pub fn detect_raw(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        let (canvas, placement) = letterbox(image, INPUT_SIZE, INPUT_SIZE, Rgb([PIXEL_MEAN as u8; 3]));
        let input = to_tensor(&canvas);

        let mut session = self
            .session
            .lock()
            .map_err(|e| DetectorError::InferenceFailed(format!("SCRFD session poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |idx: usize, what: &str, stride: usize| {
            outputs[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} at stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (&stride, slots) in STRIDES.iter().zip(self.layout.iter()) {
            let level = StrideTensors {
                stride,
                scores: extract(slots.scores, "scores", stride)?,
                boxes: extract(slots.boxes, "boxes", stride)?,
                landmarks: extract(slots.landmarks, "landmarks", stride)?,
            };
            candidates.extend(decode_level(&level, INPUT_SIZE as usize, &placement, SCORE_THRESHOLD));
        }

        Ok(nms(candidates, NMS_IOU))
    }
}

fn to_tensor(canvas: &RgbImage) -> Array4<f32> {
    let (w, h) = (canvas.width() as usize, canvas.height() as usize);
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        (canvas.get_pixel(x as u32, y as u32)[c] as f32 - PIXEL_MEAN) / PIXEL_STD
    })
}

/// Map output tensors to stride slots.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32` and so on, or
/// number them; numbered exports list all scores, then all boxes, then all
/// landmarks, each in stride order.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named = |i: usize| {
        let stride = STRIDES[i];
        Some(StrideOutputs {
            scores: position("score", stride)?,
            boxes: position("bbox", stride)?,
            landmarks: position("kps", stride)?,
        })
    };

    match (named(0), named(1), named(2)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD outputs unnamed, assuming positional layout");
            std::array::from_fn(|i| StrideOutputs {
                scores: i,
                boxes: STRIDES.len() + i,
                landmarks: 2 * STRIDES.len() + i,
            })
        }
    }
}

/// Decode one stride level. Distances are in stride units from the anchor
/// centre; results are unmapped back through the letterbox.
fn decode_level(
    level: &StrideTensors<'_>,
    input_size: usize,
    placement: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawDetection> {
    let cells = input_size / level.stride;
    let s = level.stride as f32;

    (0..cells * cells * ANCHORS_PER_CELL)
        .filter_map(|anchor| {
            let score = *level.scores.get(anchor)?;
            if score <= threshold {
                return None;
            }
            let cell = anchor / ANCHORS_PER_CELL;
            let (cx, cy) = ((cell % cells) as f32 * s, (cell / cells) as f32 * s);

            let d = level.boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (x1, y1) = placement.unmap(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = placement.unmap(cx + d[2] * s, cy + d[3] * s);

            let landmarks = level
                .landmarks
                .get(anchor * 10..anchor * 10 + 10)
                .map(|k| std::array::from_fn(|i| placement.unmap(cx + k[2 * i] * s, cy + k[2 * i + 1] * s)));

            Some(RawDetection {
                x1,
                y1,
                x2,
                y2,
                score,
                landmarks,
            })
        })
        .collect()
}
