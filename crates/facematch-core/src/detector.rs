//! Detector capability and the helpers shared by the detector adapters:
//! letterboxing, tiled search for upsampling, NMS and the ensemble runner.

use crate::types::{BoundingBox, Landmarks};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_UPSAMPLE: u32 = 2;
pub const MAX_UPSAMPLE: u32 = 4;
pub const DEFAULT_MAX_FACES: usize = 30;
/// Fraction of a tile shared with its neighbour in tiled search.
const TILE_OVERLAP: f32 = 0.25;
/// IoU above which detections from overlapping tiles are suppressed.
const TILE_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("model load failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detector backend families, in ensemble priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorFamily {
    /// Anchor-based deep region detector; most accurate, slowest.
    RetinaFace,
    /// Detector half of the InsightFace analysis service.
    InsightFace,
    /// Detector half of the DeepFace analysis service.
    DeepFace,
    /// Heavier single-shot CNN detector.
    Cnn,
    /// Fast, coarse detector.
    Hog,
    /// Cascade detector tuned for small faces.
    Haar,
}

impl DetectorFamily {
    pub fn name(self) -> &'static str {
        match self {
            DetectorFamily::RetinaFace => "retinaface",
            DetectorFamily::InsightFace => "insightface",
            DetectorFamily::DeepFace => "deepface",
            DetectorFamily::Cnn => "cnn",
            DetectorFamily::Hog => "hog",
            DetectorFamily::Haar => "opencv_haar",
        }
    }

    /// Whether the upsample factor changes how this family searches.
    pub fn is_scale_sensitive(self) -> bool {
        matches!(self, DetectorFamily::Cnn | DetectorFamily::Hog)
    }
}

impl fmt::Display for DetectorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-call tuning shared by every detector in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectOptions {
    /// Extra search resolution for small faces, 1–4.
    pub upsample: u32,
    /// Cap on boxes any single detector contributes.
    pub max_faces: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            upsample: DEFAULT_UPSAMPLE,
            max_faces: DEFAULT_MAX_FACES,
        }
    }
}

impl DetectOptions {
    pub fn new(upsample: u32, max_faces: usize) -> Self {
        Self {
            upsample: upsample.clamp(1, MAX_UPSAMPLE),
            max_faces,
        }
    }
}

/// "Boxes from image" capability. Implementations return canonical
/// `(top, right, bottom, left)` boxes within the image, at most
/// `options.max_faces` of them, in the backend's own reporting order.
pub trait FaceDetector: Send + Sync {
    fn family(&self) -> DetectorFamily;

    fn detect(&self, image: &RgbImage, options: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Outcome of one ensemble member.
#[derive(Debug)]
pub struct DetectorOutcome {
    pub family: DetectorFamily,
    pub result: Result<Vec<BoundingBox>, DetectorError>,
}

/// Run every detector in priority order. A failing detector never stops the
/// remaining ones; its failure is carried in its outcome.
pub fn detect_all(
    detectors: &[Arc<dyn FaceDetector>],
    image: &RgbImage,
    options: &DetectOptions,
) -> Vec<DetectorOutcome> {
    detectors
        .iter()
        .map(|d| {
            let result = d.detect(image, options).map(|mut boxes| {
                boxes.truncate(options.max_faces);
                boxes
            });
            DetectorOutcome {
                family: d.family(),
                result,
            }
        })
        .collect()
}

/// Concatenate ensemble boxes in priority order, absorbing failed detectors.
pub fn ensemble_boxes(outcomes: Vec<DetectorOutcome>) -> Vec<BoundingBox> {
    let mut all = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(boxes) => {
                tracing::debug!(detector = %outcome.family, count = boxes.len(), "detector contributed boxes");
                all.extend(boxes);
            }
            Err(e) => {
                tracing::warn!(detector = %outcome.family, error = %e, "detector failed, contributing nothing");
            }
        }
    }
    all
}

/// Raw detector output in floating-point corner form `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub landmarks: Option<Landmarks>,
}

impl RawDetection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Shift by `(dx, dy)`, mapping crop coordinates back to the parent image.
    pub fn translate(mut self, dx: f32, dy: f32) -> Self {
        self.x1 += dx;
        self.x2 += dx;
        self.y1 += dy;
        self.y2 += dy;
        if let Some(lms) = self.landmarks.as_mut() {
            for (x, y) in lms.iter_mut() {
                *x += dx;
                *y += dy;
            }
        }
        self
    }

    /// Translate to the canonical box, clamped to the image.
    pub fn to_box(&self, width: u32, height: u32) -> Option<BoundingBox> {
        BoundingBox::from_corners(self.x1, self.y1, self.x2, self.y2, width, height)
    }
}

/// Convert raw detections to canonical boxes, dropping degenerate ones and
/// keeping at most `max_faces`.
pub fn to_boxes(detections: &[RawDetection], width: u32, height: u32, max_faces: usize) -> Vec<BoundingBox> {
    detections
        .iter()
        .filter_map(|d| d.to_box(width, height))
        .take(max_faces)
        .collect()
}

fn raw_iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Non-Maximum Suppression; output sorted by score, highest first.
pub fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<RawDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| raw_iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Mapping from letterboxed model-input space back to the source image.
#[derive(Debug, Clone, Copy)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxInfo {
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Fit `image` inside a `width × height` canvas, preserving aspect ratio and
/// centring it on a `fill` background.
pub fn letterbox(image: &RgbImage, width: u32, height: u32, fill: Rgb<u8>) -> (RgbImage, LetterboxInfo) {
    let scale = (width as f32 / image.width().max(1) as f32).min(height as f32 / image.height().max(1) as f32);
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, width);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, height);
    let pad_x = (width - new_w) / 2;
    let pad_y = (height - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(width, height, fill);
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Search regions for a given upsample factor: the whole image, plus an
/// `upsample × upsample` grid of overlapping tiles when `upsample > 1`.
/// Each tile is searched at full model resolution, which is what lets
/// fixed-input detectors find faces too small for a single pass.
pub fn search_regions(width: u32, height: u32, upsample: u32) -> Vec<(u32, u32, u32, u32)> {
    let mut regions = vec![(0, 0, width, height)];
    let k = upsample.clamp(1, MAX_UPSAMPLE);
    if k == 1 || width == 0 || height == 0 {
        return regions;
    }

    let tile_w = ((width as f32 / k as f32) * (1.0 + TILE_OVERLAP)).ceil().min(width as f32) as u32;
    let tile_h = ((height as f32 / k as f32) * (1.0 + TILE_OVERLAP)).ceil().min(height as f32) as u32;
    let step_x = (width - tile_w) as f32 / (k - 1) as f32;
    let step_y = (height - tile_h) as f32 / (k - 1) as f32;

    for row in 0..k {
        for col in 0..k {
            let x = (col as f32 * step_x).round() as u32;
            let y = (row as f32 * step_y).round() as u32;
            regions.push((x, y, tile_w.min(width - x), tile_h.min(height - y)));
        }
    }
    regions
}

/// Run `detect_region` over every search region and fuse the results with NMS.
pub fn detect_tiled<F>(image: &RgbImage, upsample: u32, mut detect_region: F) -> Result<Vec<RawDetection>, DetectorError>
where
    F: FnMut(&RgbImage) -> Result<Vec<RawDetection>, DetectorError>,
{
    let (width, height) = image.dimensions();
    let regions = search_regions(width, height, upsample);
    if regions.len() == 1 {
        return detect_region(image);
    }

    let mut all = Vec::new();
    for (x, y, w, h) in regions {
        let tile = imageops::crop_imm(image, x, y, w, h).to_image();
        all.extend(
            detect_region(&tile)?
                .into_iter()
                .map(|d| d.translate(x as f32, y as f32)),
        );
    }
    Ok(nms(all, TILE_NMS_THRESHOLD))
}
