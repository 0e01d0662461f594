//! Analysis packs (SCRFD detector + ArcFace recognizer) and the lazily
//! constructed handle that the service detector and encoder adapters share.
//!
//! A pack is loaded at most once per handle, on first use. The same handle is
//! injected into both adapters of a service so detection and encoding run on
//! one pair of sessions.

use crate::alignment;
use crate::arcface::ArcFaceRecognizer;
use crate::detector::{to_boxes, DetectOptions, DetectorError, DetectorFamily, FaceDetector, RawDetection};
use crate::encoder::{crop_face, EncoderError, EncoderFamily, FaceEncoder};
use crate::merge::iou;
use crate::scrfd::ScrfdDetector;
use crate::types::{BoundingBox, Embedding, Landmarks};
use image::RgbImage;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// Context kept around a box when re-detecting inside it.
const SERVICE_CROP_MARGIN: f32 = 0.2;

/// Detection with landmarks plus embedding of aligned crops.
pub trait FaceAnalyzer: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError>;

    /// Embed a face already aligned to the 112×112 layout.
    fn embed_aligned(&self, face: &RgbImage) -> Result<Embedding, EncoderError>;
}

pub struct AnalysisPack {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
}

impl AnalysisPack {
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, String> {
        let detector = ScrfdDetector::load(detector_path).map_err(|e| e.to_string())?;
        let recognizer = ArcFaceRecognizer::load(recognizer_path).map_err(|e| e.to_string())?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for AnalysisPack {
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        self.detector.detect_raw(image)
    }

    fn embed_aligned(&self, face: &RgbImage) -> Result<Embedding, EncoderError> {
        self.recognizer.embed(face)
    }
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn FaceAnalyzer>, String> + Send + Sync>;

/// Initialise-once handle to an analysis pack.
///
/// A failed load is remembered; later calls report the same cause without
/// retrying. The handle also keeps the last whole-image detection, so a
/// service's detector and encoder adapters run the pack detector once per
/// image.
pub struct LazyAnalysis {
    name: &'static str,
    loader: Loader,
    cell: OnceLock<Result<Arc<dyn FaceAnalyzer>, String>>,
    last_whole: Mutex<Option<(u64, Vec<RawDetection>)>>,
}

impl LazyAnalysis {
    pub fn new<F>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn FaceAnalyzer>, String> + Send + Sync + 'static,
    {
        Self {
            name,
            loader: Box::new(loader),
            cell: OnceLock::new(),
            last_whole: Mutex::new(None),
        }
    }

    /// Handle for the SCRFD + ArcFace pack stored at the given paths.
    pub fn from_files(name: &'static str, detector_path: PathBuf, recognizer_path: PathBuf) -> Self {
        Self::new(name, move || {
            let pack = AnalysisPack::load(&detector_path, &recognizer_path)?;
            Ok(Arc::new(pack) as Arc<dyn FaceAnalyzer>)
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }

    pub fn get(&self) -> Result<Arc<dyn FaceAnalyzer>, String> {
        self.cell
            .get_or_init(|| {
                let loaded = (self.loader)();
                match &loaded {
                    Ok(_) => tracing::info!(service = self.name, "analysis pack ready"),
                    Err(e) => tracing::error!(service = self.name, error = %e, "analysis pack failed to load"),
                }
                loaded
            })
            .clone()
    }

    /// Whole-image detection through `pack`, reusing the previous result
    /// when called again with the same pixels.
    pub fn detect_whole(&self, pack: &dyn FaceAnalyzer, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        let key = image_key(image);
        let mut last = self
            .last_whole
            .lock()
            .map_err(|e| DetectorError::InferenceFailed(format!("{} detection cache poisoned: {e}", self.name)))?;
        if let Some((cached_key, dets)) = last.as_ref() {
            if *cached_key == key {
                tracing::trace!(service = self.name, "reusing whole-image detection");
                return Ok(dets.clone());
            }
        }
        let dets = pack.detect(image)?;
        *last = Some((key, dets.clone()));
        Ok(dets)
    }
}

fn image_key(image: &RgbImage) -> u64 {
    let mut hasher = DefaultHasher::new();
    image.dimensions().hash(&mut hasher);
    image.as_raw().hash(&mut hasher);
    hasher.finish()
}

/// Detector adapter over a shared analysis pack.
pub struct ServiceDetector {
    family: DetectorFamily,
    handle: Arc<LazyAnalysis>,
}

impl ServiceDetector {
    pub fn new(family: DetectorFamily, handle: Arc<LazyAnalysis>) -> Self {
        Self { family, handle }
    }
}

impl FaceDetector for ServiceDetector {
    fn family(&self) -> DetectorFamily {
        self.family
    }

    fn detect(&self, image: &RgbImage, options: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError> {
        let pack = self.handle.get().map_err(DetectorError::Unavailable)?;
        let dets = self.handle.detect_whole(pack.as_ref(), image)?;
        Ok(to_boxes(&dets, image.width(), image.height(), options.max_faces))
    }
}

/// Encoder adapter over a shared analysis pack.
///
/// Landmarks for alignment come from the pack's own detector: run once over
/// the whole image, or, with `crop_per_box`, inside each box grown by some
/// context. A box no detection overlaps is embedded from its resized crop.
pub struct ServiceEncoder {
    family: EncoderFamily,
    handle: Arc<LazyAnalysis>,
    crop_per_box: bool,
}

impl ServiceEncoder {
    pub fn new(family: EncoderFamily, handle: Arc<LazyAnalysis>, crop_per_box: bool) -> Self {
        Self {
            family,
            handle,
            crop_per_box,
        }
    }

    fn encode_cropped(&self, pack: &dyn FaceAnalyzer, image: &RgbImage, bbox: &BoundingBox) -> Result<Embedding, EncoderError> {
        let (crop, region) = crop_face(image, bbox, SERVICE_CROP_MARGIN)?;
        let dets = pack.detect(&crop)?;
        match best_landmarks(&dets, bbox, &region, crop.width(), crop.height())
            .and_then(|lms| alignment::align_face(&crop, &lms))
        {
            Some(face) => pack.embed_aligned(&face),
            None => {
                tracing::debug!(?bbox, "no landmarks inside crop, embedding resized crop");
                pack.embed_aligned(&crop)
            }
        }
    }
}

impl FaceEncoder for ServiceEncoder {
    fn family(&self) -> EncoderFamily {
        self.family
    }

    fn encode(&self, image: &RgbImage, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError> {
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let pack = self.handle.get().map_err(EncoderError::Unavailable)?;

        if self.crop_per_box {
            return boxes
                .iter()
                .map(|bbox| self.encode_cropped(pack.as_ref(), image, bbox))
                .collect();
        }

        let (width, height) = image.dimensions();
        let whole = BoundingBox::new(0, width as i32, height as i32, 0);
        let dets = self.handle.detect_whole(pack.as_ref(), image)?;
        boxes
            .iter()
            .map(|bbox| {
                let aligned = best_landmarks(&dets, bbox, &whole, width, height)
                    .and_then(|lms| alignment::align_face(image, &lms));
                match aligned {
                    Some(face) => pack.embed_aligned(&face),
                    None => {
                        let (crop, _) = crop_face(image, bbox, 0.0)?;
                        pack.embed_aligned(&crop)
                    }
                }
            })
            .collect()
    }
}

/// Landmarks of the crop detection that best overlaps the requested box.
fn best_landmarks(
    dets: &[RawDetection],
    target: &BoundingBox,
    region: &BoundingBox,
    crop_width: u32,
    crop_height: u32,
) -> Option<Landmarks> {
    dets.iter()
        .filter_map(|d| {
            let lms = d.landmarks?;
            let found = d.to_box(crop_width, crop_height)?.offset(region.left, region.top);
            Some((iou(&found, target), lms))
        })
        .filter(|(overlap, _)| *overlap > 0.0)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, lms)| lms)
}
