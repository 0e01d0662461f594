//! Pipeline selection: configured model name → resolved [`PipelineSpec`].
//!
//! Every name maps to an ordered fallback chain of pipeline kinds. The first
//! kind whose backend runtimes are all present wins; an exhausted chain is a
//! configuration error. Resolutions are cached per name.

use crate::classical::{CASCADE_MAX_JITTERS, DEFAULT_JITTERS, ENSEMBLE_JITTERS};
use crate::detector::{DetectOptions, DetectorFamily};
use crate::encoder::EncoderFamily;
use crate::merge::{DEFAULT_IOU_THRESHOLD, FULL_ENSEMBLE_IOU_THRESHOLD};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

pub const DEFAULT_PIPELINE: &str = "all_models";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unknown pipeline {0:?}")]
    UnknownPipeline(String),
    #[error("no runtime available for pipeline {name:?} (tried {tried})")]
    Exhausted { name: String, tried: String },
}

/// Backend runtimes whose presence gates a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    RetinaFace,
    /// SCRFD + ArcFace pack of the InsightFace service.
    InsightFace,
    /// SCRFD + ArcFace pack of the DeepFace service.
    DeepFace,
    Cnn,
    Hog,
    Haar,
    ClassicalEncoder,
}

impl Runtime {
    pub const ALL: [Runtime; 7] = [
        Runtime::RetinaFace,
        Runtime::InsightFace,
        Runtime::DeepFace,
        Runtime::Cnn,
        Runtime::Hog,
        Runtime::Haar,
        Runtime::ClassicalEncoder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Runtime::RetinaFace => "retinaface",
            Runtime::InsightFace => "insightface",
            Runtime::DeepFace => "deepface",
            Runtime::Cnn => "cnn",
            Runtime::Hog => "hog",
            Runtime::Haar => "opencv_haar",
            Runtime::ClassicalEncoder => "classical_encoder",
        }
    }

    /// Runtime backing a detector family.
    pub fn for_detector(family: DetectorFamily) -> Self {
        match family {
            DetectorFamily::RetinaFace => Runtime::RetinaFace,
            DetectorFamily::InsightFace => Runtime::InsightFace,
            DetectorFamily::DeepFace => Runtime::DeepFace,
            DetectorFamily::Cnn => Runtime::Cnn,
            DetectorFamily::Hog => Runtime::Hog,
            DetectorFamily::Haar => Runtime::Haar,
        }
    }
}

/// Which backend runtimes are present.
pub trait RuntimeCatalog: Send + Sync {
    fn is_available(&self, runtime: Runtime) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Deep detector + CNN + HOG + Haar, enhanced input, classical encoder.
    AllModels,
    /// CNN + HOG + Haar with the classical encoder.
    BestOfClassical,
    /// One classical detector with the classical encoder.
    Single(DetectorFamily),
    /// Deep detector with the classical encoder applied per box.
    DeepDetectorClassical,
    InsightFace,
    DeepFace,
    /// RetinaFace boxes embedded by the InsightFace recognizer.
    RetinaArcFace,
}

const CLASSICAL_DETECTORS: [DetectorFamily; 3] = [DetectorFamily::Cnn, DetectorFamily::Hog, DetectorFamily::Haar];

impl PipelineKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "all_models" => PipelineKind::AllModels,
            "dlib_best" => PipelineKind::BestOfClassical,
            "hog" => PipelineKind::Single(DetectorFamily::Hog),
            "cnn" => PipelineKind::Single(DetectorFamily::Cnn),
            "opencv_haar" => PipelineKind::Single(DetectorFamily::Haar),
            "retinaface_dlib" => PipelineKind::DeepDetectorClassical,
            "insightface" => PipelineKind::InsightFace,
            "deepface" => PipelineKind::DeepFace,
            "retinaface" => PipelineKind::RetinaArcFace,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            PipelineKind::AllModels => "all_models",
            PipelineKind::BestOfClassical => "dlib_best",
            PipelineKind::Single(family) => family.name(),
            PipelineKind::DeepDetectorClassical => "retinaface_dlib",
            PipelineKind::InsightFace => "insightface",
            PipelineKind::DeepFace => "deepface",
            PipelineKind::RetinaArcFace => "retinaface",
        }
    }

    /// This kind followed by its fallbacks, in the order they are tried.
    pub fn chain(self) -> Vec<PipelineKind> {
        let classical_tail = [
            PipelineKind::BestOfClassical,
            PipelineKind::Single(DetectorFamily::Hog),
            PipelineKind::Single(DetectorFamily::Cnn),
            PipelineKind::Single(DetectorFamily::Haar),
        ];
        match self {
            PipelineKind::BestOfClassical => classical_tail.to_vec(),
            PipelineKind::Single(DetectorFamily::Haar) => {
                vec![self, PipelineKind::Single(DetectorFamily::Cnn)]
            }
            PipelineKind::Single(_) => vec![self],
            _ => std::iter::once(self).chain(classical_tail).collect(),
        }
    }

    /// Pipeline to re-run when this one yields no encodings at all.
    pub fn retry_on_empty(self) -> Option<PipelineKind> {
        match self {
            PipelineKind::DeepDetectorClassical => Some(PipelineKind::BestOfClassical),
            _ => None,
        }
    }

    fn encoder(self) -> EncoderFamily {
        match self {
            PipelineKind::InsightFace | PipelineKind::RetinaArcFace => EncoderFamily::InsightFace,
            PipelineKind::DeepFace => EncoderFamily::DeepFace,
            _ => EncoderFamily::Classical,
        }
    }

    fn jitters(self) -> u32 {
        match self {
            PipelineKind::AllModels | PipelineKind::BestOfClassical => ENSEMBLE_JITTERS,
            PipelineKind::Single(DetectorFamily::Haar) => DEFAULT_JITTERS.min(CASCADE_MAX_JITTERS),
            PipelineKind::InsightFace | PipelineKind::DeepFace | PipelineKind::RetinaArcFace => 1,
            _ => DEFAULT_JITTERS,
        }
    }

    /// Preferred deep detector: RetinaFace, else the InsightFace pack.
    fn deep_detector(catalog: &dyn RuntimeCatalog) -> Option<DetectorFamily> {
        if catalog.is_available(Runtime::RetinaFace) {
            Some(DetectorFamily::RetinaFace)
        } else if catalog.is_available(Runtime::InsightFace) {
            Some(DetectorFamily::InsightFace)
        } else {
            None
        }
    }

    /// Detector families this kind would run given `catalog`, in priority
    /// order, or `None` when the kind cannot run.
    fn detectors(self, catalog: &dyn RuntimeCatalog) -> Option<Vec<DetectorFamily>> {
        let has = |runtime| catalog.is_available(runtime);
        let classical: Vec<DetectorFamily> = CLASSICAL_DETECTORS
            .into_iter()
            .filter(|f| has(Runtime::for_detector(*f)))
            .collect();

        let detectors = match self {
            PipelineKind::AllModels => {
                let deep = Self::deep_detector(catalog)?;
                std::iter::once(deep).chain(classical).collect()
            }
            PipelineKind::BestOfClassical => {
                if classical.len() < 2 {
                    return None;
                }
                classical
            }
            PipelineKind::Single(family) => {
                if !has(Runtime::for_detector(family)) {
                    return None;
                }
                vec![family]
            }
            PipelineKind::DeepDetectorClassical => vec![Self::deep_detector(catalog)?],
            PipelineKind::InsightFace => has(Runtime::InsightFace).then(|| vec![DetectorFamily::InsightFace])?,
            PipelineKind::DeepFace => has(Runtime::DeepFace).then(|| vec![DetectorFamily::DeepFace])?,
            PipelineKind::RetinaArcFace => (has(Runtime::RetinaFace) && has(Runtime::InsightFace))
                .then(|| vec![DetectorFamily::RetinaFace])?,
        };

        let encoder_ok = match self.encoder() {
            EncoderFamily::Classical => has(Runtime::ClassicalEncoder),
            EncoderFamily::InsightFace => has(Runtime::InsightFace),
            EncoderFamily::DeepFace => has(Runtime::DeepFace),
        };
        encoder_ok.then_some(detectors)
    }

    /// Build the spec for this kind, or `None` when a runtime is missing.
    pub fn spec(self, catalog: &dyn RuntimeCatalog, options: &DetectOptions) -> Option<PipelineSpec> {
        let detectors = self.detectors(catalog)?;
        Some(PipelineSpec {
            kind: self,
            detectors,
            encoder: self.encoder(),
            crop_per_box: matches!(self, PipelineKind::DeepDetectorClassical | PipelineKind::RetinaArcFace),
            upsample: options.upsample,
            jitters: self.jitters(),
            iou_threshold: if self == PipelineKind::AllModels {
                FULL_ENSEMBLE_IOU_THRESHOLD
            } else {
                DEFAULT_IOU_THRESHOLD
            },
            enhance: self == PipelineKind::AllModels,
            max_faces: options.max_faces,
        })
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fully resolved processing recipe for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSpec {
    pub kind: PipelineKind,
    /// Detector families in ensemble priority order.
    pub detectors: Vec<DetectorFamily>,
    pub encoder: EncoderFamily,
    /// Encoder works on per-box crops rather than the whole image.
    pub crop_per_box: bool,
    pub upsample: u32,
    pub jitters: u32,
    pub iou_threshold: f32,
    pub enhance: bool,
    pub max_faces: usize,
}

impl PipelineSpec {
    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions::new(self.upsample, self.max_faces)
    }

    /// Boxes are merged only when more than one detector contributes.
    pub fn merges(&self) -> bool {
        self.detectors.len() > 1
    }
}

pub struct ModelSelector<C> {
    catalog: C,
    options: DetectOptions,
    cache: Mutex<HashMap<String, PipelineSpec>>,
}

impl<C: RuntimeCatalog> ModelSelector<C> {
    pub fn new(catalog: C, options: DetectOptions) -> Self {
        Self {
            catalog,
            options,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn resolve(&self, name: &str) -> Result<PipelineSpec, SelectorError> {
        if let Some(spec) = self.cache.lock().ok().and_then(|c| c.get(name).cloned()) {
            return Ok(spec);
        }

        let kind = PipelineKind::from_name(name).ok_or_else(|| SelectorError::UnknownPipeline(name.to_string()))?;
        let chain = kind.chain();
        let spec = chain
            .iter()
            .find_map(|k| {
                let spec = k.spec(&self.catalog, &self.options);
                if spec.is_none() {
                    tracing::debug!(pipeline = %k, "pipeline runtime unavailable");
                }
                spec
            })
            .ok_or_else(|| SelectorError::Exhausted {
                name: name.to_string(),
                tried: chain.iter().map(|k| k.name()).collect::<Vec<_>>().join(", "),
            })?;

        if spec.kind != kind {
            tracing::warn!(requested = name, resolved = %spec.kind, "pipeline unavailable, using fallback");
        }
        tracing::info!(
            pipeline = %spec.kind,
            detectors = ?spec.detectors,
            encoder = %spec.encoder,
            jitters = spec.jitters,
            "pipeline resolved"
        );

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), spec.clone());
        }
        Ok(spec)
    }

    /// Spec for the pipeline to retry with when `spec` finds nothing.
    pub fn retry_on_empty(&self, spec: &PipelineSpec) -> Option<PipelineSpec> {
        spec.kind
            .retry_on_empty()
            .and_then(|k| k.spec(&self.catalog, &self.options))
    }
}
