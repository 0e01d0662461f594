//! The image-processing engine: bytes in, deduplicated encodings out.
//!
//! ```text
//! decode → preprocess → detect (ensemble) → merge → cap → encode → dedup
//! ```
//!
//! Detector failures are absorbed by the ensemble. Decode and encoder
//! failures fail the whole call.

use crate::dedup::{dedup, DEFAULT_SIMILARITY_THRESHOLD};
use crate::detector::{detect_all, ensemble_boxes, DetectorError, FaceDetector};
use crate::encoder::{EncoderError, FaceEncoder};
use crate::merge::merge;
use crate::preprocess::{decode, preprocess, PreprocessError};
use crate::registry::ModelRegistry;
use crate::selector::{ModelSelector, PipelineSpec, RuntimeCatalog, SelectorError};
use crate::types::{EncodingSet, EncodingSetError};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] PreprocessError),
    #[error("pipeline configuration: {0}")]
    Selector(#[from] SelectorError),
    #[error("detector setup failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoding failed: {0}")]
    Encoder(#[from] EncoderError),
    #[error("encoder returned {got} embeddings for {expected} faces")]
    EncodingCount { expected: usize, got: usize },
    #[error("inconsistent encodings: {0}")]
    EncodingSet(#[from] EncodingSetError),
}

/// Result of processing one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedImage {
    pub face_count: usize,
    pub encodings: EncodingSet,
}

pub struct FaceEngine {
    spec: PipelineSpec,
    detectors: Vec<Arc<dyn FaceDetector>>,
    encoder: Arc<dyn FaceEncoder>,
    /// Pipeline to re-run when this one yields nothing.
    retry: Option<Box<FaceEngine>>,
}

impl FaceEngine {
    pub fn new(spec: PipelineSpec, detectors: Vec<Arc<dyn FaceDetector>>, encoder: Arc<dyn FaceEncoder>) -> Self {
        Self {
            spec,
            detectors,
            encoder,
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: FaceEngine) -> Self {
        self.retry = Some(Box::new(retry));
        self
    }

    /// Resolve `name` against the registry's models and load everything the
    /// resulting pipeline needs. Fails fast on configuration errors.
    pub fn build<C: RuntimeCatalog>(
        registry: &ModelRegistry,
        selector: &ModelSelector<C>,
        name: &str,
    ) -> Result<Self, EngineError> {
        let spec = selector.resolve(name)?;
        let retry = match selector.retry_on_empty(&spec) {
            Some(retry_spec) => Some(Self::from_spec(registry, retry_spec)?),
            None => None,
        };
        let engine = Self::from_spec(registry, spec)?;
        Ok(match retry {
            Some(retry) => engine.with_retry(retry),
            None => engine,
        })
    }

    fn from_spec(registry: &ModelRegistry, mut spec: PipelineSpec) -> Result<Self, EngineError> {
        let detectors = registry.detectors(&spec)?;
        // Members that failed to load no longer count towards the ensemble.
        spec.detectors = detectors.iter().map(|d| d.family()).collect();
        let encoder = registry.encoder(&spec)?;
        Ok(Self::new(spec, detectors, encoder))
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn process_image(&self, bytes: &[u8]) -> Result<ProcessedImage, EngineError> {
        let image = decode(bytes)?;
        self.process(&image)
    }

    pub fn process(&self, image: &RgbImage) -> Result<ProcessedImage, EngineError> {
        let processed = self.run(image)?;
        if processed.face_count > 0 {
            return Ok(processed);
        }
        match &self.retry {
            Some(retry) => {
                tracing::info!(
                    pipeline = %self.spec.kind,
                    retry = %retry.spec.kind,
                    "no encodings produced, retrying with fallback pipeline"
                );
                retry.process(image)
            }
            None => Ok(processed),
        }
    }

    fn run(&self, image: &RgbImage) -> Result<ProcessedImage, EngineError> {
        let prepared = preprocess(image, self.spec.enhance);
        let options = self.spec.detect_options();

        let outcomes = detect_all(&self.detectors, &prepared, &options);
        let mut boxes = ensemble_boxes(outcomes);
        if self.spec.merges() {
            boxes = merge(&boxes, self.spec.iou_threshold);
        }
        boxes.truncate(self.spec.max_faces);

        if boxes.is_empty() {
            tracing::debug!(pipeline = %self.spec.kind, "no faces detected");
            return Ok(ProcessedImage {
                face_count: 0,
                encodings: EncodingSet::default(),
            });
        }

        let embeddings = self.encoder.encode(&prepared, &boxes)?;
        if embeddings.len() != boxes.len() {
            return Err(EngineError::EncodingCount {
                expected: boxes.len(),
                got: embeddings.len(),
            });
        }

        let unique = dedup(embeddings, DEFAULT_SIMILARITY_THRESHOLD);
        let encodings = EncodingSet::new(unique)?;
        tracing::debug!(
            pipeline = %self.spec.kind,
            boxes = boxes.len(),
            faces = encodings.len(),
            "image processed"
        );
        Ok(ProcessedImage {
            face_count: encodings.len(),
            encodings,
        })
    }
}
