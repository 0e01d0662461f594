//! Model registry: maps backend runtimes to model files under one directory
//! and builds the detector and encoder adapters a resolved pipeline needs.
//!
//! This is the only place that turns a family name into a concrete
//! implementation. Loaded models are cached, so pipelines that share a
//! backend (a pipeline and its retry pipeline, say) share one session.

use crate::analysis::{LazyAnalysis, ServiceDetector, ServiceEncoder};
use crate::cascade::CascadeDetector;
use crate::classical::ClassicalEncoder;
use crate::detector::{DetectorError, DetectorFamily, FaceDetector};
use crate::encoder::{EncoderError, EncoderFamily, FaceEncoder};
use crate::retinaface::RetinaFaceDetector;
use crate::selector::{PipelineSpec, Runtime, RuntimeCatalog};
use crate::ultraface::{UltraFaceDetector, ACCURATE_INPUT, FAST_INPUT};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const RETINAFACE_MODEL: &str = "retinaface_mnet025.onnx";
pub const INSIGHTFACE_DETECTOR_MODEL: &str = "det_10g.onnx";
pub const INSIGHTFACE_RECOGNIZER_MODEL: &str = "w600k_r50.onnx";
pub const DEEPFACE_DETECTOR_MODEL: &str = "det_500m.onnx";
pub const DEEPFACE_RECOGNIZER_MODEL: &str = "arcface_r100.onnx";
pub const CNN_MODEL: &str = "version-RFB-640.onnx";
pub const HOG_MODEL: &str = "version-RFB-320.onnx";
pub const HAAR_MODEL: &str = "seeta_fd_frontal_v1.0.bin";
pub const CLASSICAL_ENCODER_MODEL: &str = "dlib_face_recognition_resnet_model_v1.onnx";

/// Files that must exist for a runtime to count as available.
pub fn runtime_files(runtime: Runtime) -> &'static [&'static str] {
    match runtime {
        Runtime::RetinaFace => &[RETINAFACE_MODEL],
        Runtime::InsightFace => &[INSIGHTFACE_DETECTOR_MODEL, INSIGHTFACE_RECOGNIZER_MODEL],
        Runtime::DeepFace => &[DEEPFACE_DETECTOR_MODEL, DEEPFACE_RECOGNIZER_MODEL],
        Runtime::Cnn => &[CNN_MODEL],
        Runtime::Hog => &[HOG_MODEL],
        Runtime::Haar => &[HAAR_MODEL],
        Runtime::ClassicalEncoder => &[CLASSICAL_ENCODER_MODEL],
    }
}

impl<T: RuntimeCatalog + ?Sized> RuntimeCatalog for Arc<T> {
    fn is_available(&self, runtime: Runtime) -> bool {
        (**self).is_available(runtime)
    }
}

pub struct ModelRegistry {
    model_dir: PathBuf,
    insightface: Arc<LazyAnalysis>,
    deepface: Arc<LazyAnalysis>,
    detectors: Mutex<HashMap<DetectorFamily, Arc<dyn FaceDetector>>>,
    classical: Mutex<Option<ClassicalEncoder>>,
}

impl ModelRegistry {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        let model_dir = model_dir.into();
        let insightface = LazyAnalysis::from_files(
            "insightface",
            model_dir.join(INSIGHTFACE_DETECTOR_MODEL),
            model_dir.join(INSIGHTFACE_RECOGNIZER_MODEL),
        );
        let deepface = LazyAnalysis::from_files(
            "deepface",
            model_dir.join(DEEPFACE_DETECTOR_MODEL),
            model_dir.join(DEEPFACE_RECOGNIZER_MODEL),
        );
        Self::with_services(model_dir, Arc::new(insightface), Arc::new(deepface))
    }

    /// Registry with explicitly provided service handles.
    pub fn with_services(model_dir: PathBuf, insightface: Arc<LazyAnalysis>, deepface: Arc<LazyAnalysis>) -> Self {
        Self {
            model_dir,
            insightface,
            deepface,
            detectors: Mutex::new(HashMap::new()),
            classical: Mutex::new(None),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Availability of every runtime, in declaration order.
    pub fn report(&self) -> Vec<(Runtime, bool)> {
        Runtime::ALL.iter().map(|&r| (r, self.is_available(r))).collect()
    }

    fn path(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }

    pub fn detector(&self, family: DetectorFamily) -> Result<Arc<dyn FaceDetector>, DetectorError> {
        let mut cache = self
            .detectors
            .lock()
            .map_err(|e| DetectorError::Unavailable(format!("detector cache poisoned: {e}")))?;
        if let Some(detector) = cache.get(&family) {
            return Ok(detector.clone());
        }

        let detector: Arc<dyn FaceDetector> = match family {
            DetectorFamily::RetinaFace => Arc::new(RetinaFaceDetector::load(&self.path(RETINAFACE_MODEL))?),
            DetectorFamily::InsightFace => Arc::new(ServiceDetector::new(family, self.insightface.clone())),
            DetectorFamily::DeepFace => Arc::new(ServiceDetector::new(family, self.deepface.clone())),
            DetectorFamily::Cnn => Arc::new(UltraFaceDetector::load(&self.path(CNN_MODEL), family, ACCURATE_INPUT)?),
            DetectorFamily::Hog => Arc::new(UltraFaceDetector::load(&self.path(HOG_MODEL), family, FAST_INPUT)?),
            DetectorFamily::Haar => Arc::new(CascadeDetector::load(&self.path(HAAR_MODEL))?),
        };
        cache.insert(family, detector.clone());
        Ok(detector)
    }

    fn classical_encoder(&self) -> Result<ClassicalEncoder, EncoderError> {
        let mut cached = self
            .classical
            .lock()
            .map_err(|e| EncoderError::Unavailable(format!("encoder cache poisoned: {e}")))?;
        if let Some(encoder) = cached.as_ref() {
            return Ok(encoder.clone());
        }
        let encoder = ClassicalEncoder::load(&self.path(CLASSICAL_ENCODER_MODEL))?;
        *cached = Some(encoder.clone());
        Ok(encoder)
    }

    pub fn encoder(&self, spec: &PipelineSpec) -> Result<Arc<dyn FaceEncoder>, EncoderError> {
        Ok(match spec.encoder {
            EncoderFamily::Classical => Arc::new(self.classical_encoder()?.with_jitters(spec.jitters)),
            EncoderFamily::InsightFace => {
                Arc::new(ServiceEncoder::new(spec.encoder, self.insightface.clone(), spec.crop_per_box))
            }
            EncoderFamily::DeepFace => {
                Arc::new(ServiceEncoder::new(spec.encoder, self.deepface.clone(), spec.crop_per_box))
            }
        })
    }

    /// Detectors of `spec` that load, in its priority order.
    ///
    /// A member that fails to load is dropped from the ensemble with a
    /// warning. Errors only when no member loads.
    pub fn detectors(&self, spec: &PipelineSpec) -> Result<Vec<Arc<dyn FaceDetector>>, DetectorError> {
        let mut loaded = Vec::with_capacity(spec.detectors.len());
        let mut last_err = None;
        for &family in &spec.detectors {
            match self.detector(family) {
                Ok(detector) => loaded.push(detector),
                Err(e) => {
                    tracing::warn!(%family, pipeline = %spec.kind, error = %e, "detector failed to load, dropping it");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if loaded.is_empty() => Err(e),
            _ => Ok(loaded),
        }
    }
}

impl RuntimeCatalog for ModelRegistry {
    fn is_available(&self, runtime: Runtime) -> bool {
        runtime_files(runtime).iter().all(|f| self.path(f).is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FaceAnalyzer;
    use crate::detector::DetectOptions;
    use crate::selector::ModelSelector;

    struct Unused;
    impl FaceAnalyzer for Unused {
        fn detect(&self, _: &image::RgbImage) -> Result<Vec<crate::detector::RawDetection>, DetectorError> {
            Ok(Vec::new())
        }
        fn embed_aligned(&self, _: &image::RgbImage) -> Result<crate::types::Embedding, EncoderError> {
            Ok(vec![0.0; 512].into())
        }
    }

    fn touch(dir: &Path, files: &[&str]) {
        for f in files {
            std::fs::write(dir.join(f), b"").unwrap();
        }
    }

    #[test]
    fn test_availability_follows_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());
        assert!(registry.report().iter().all(|(_, present)| !present));

        touch(dir.path(), &[INSIGHTFACE_DETECTOR_MODEL, HOG_MODEL]);
        assert!(registry.is_available(Runtime::Hog));
        // A pack needs both halves.
        assert!(!registry.is_available(Runtime::InsightFace));
        touch(dir.path(), &[INSIGHTFACE_RECOGNIZER_MODEL]);
        assert!(registry.is_available(Runtime::InsightFace));
    }

    #[test]
    fn test_selector_over_shared_registry() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &[CNN_MODEL, HOG_MODEL, CLASSICAL_ENCODER_MODEL]);
        let registry = Arc::new(ModelRegistry::new(dir.path()));
        let selector = ModelSelector::new(registry.clone(), DetectOptions::default());
        let spec = selector.resolve("all_models").unwrap();
        assert_eq!(spec.detectors, vec![DetectorFamily::Cnn, DetectorFamily::Hog]);
    }

    #[test]
    fn test_missing_detector_model_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path());
        let err = registry.detector(DetectorFamily::Haar).err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[test]
    fn test_service_adapters_share_injected_handle() {
        let handle = Arc::new(LazyAnalysis::new("insightface", || Ok(Arc::new(Unused) as Arc<dyn FaceAnalyzer>)));
        let deepface = Arc::new(LazyAnalysis::new("deepface", || Err("absent".into())));
        let registry = ModelRegistry::with_services(PathBuf::from("/nonexistent"), handle.clone(), deepface);

        let detector = registry.detector(DetectorFamily::InsightFace).unwrap();
        assert_eq!(detector.family(), DetectorFamily::InsightFace);
        // Cached: the same adapter comes back.
        assert!(Arc::ptr_eq(&detector, &registry.detector(DetectorFamily::InsightFace).unwrap()));
        // Registry, detector and our local clone.
        assert_eq!(Arc::strong_count(&handle), 3);
    }

    #[test]
    fn test_unloadable_detector_is_dropped_from_ensemble() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &[INSIGHTFACE_DETECTOR_MODEL, INSIGHTFACE_RECOGNIZER_MODEL, CLASSICAL_ENCODER_MODEL]);
        std::fs::write(dir.path().join(HAAR_MODEL), b"xx").unwrap();

        let insightface = Arc::new(LazyAnalysis::new("insightface", || Ok(Arc::new(Unused) as Arc<dyn FaceAnalyzer>)));
        let deepface = Arc::new(LazyAnalysis::new("deepface", || Err("absent".into())));
        let registry = Arc::new(ModelRegistry::with_services(dir.path().to_path_buf(), insightface, deepface));
        let selector = ModelSelector::new(registry.clone(), DetectOptions::default());

        let spec = selector.resolve("all_models").unwrap();
        assert_eq!(spec.detectors, vec![DetectorFamily::InsightFace, DetectorFamily::Haar]);
        let detectors = registry.detectors(&spec).unwrap();
        assert_eq!(detectors.len(), 1);
        assert_eq!(detectors[0].family(), DetectorFamily::InsightFace);
    }

    #[test]
    fn test_no_loadable_detector_is_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &[CLASSICAL_ENCODER_MODEL]);
        std::fs::write(dir.path().join(HAAR_MODEL), b"xx").unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path()));
        let selector = ModelSelector::new(registry.clone(), DetectOptions::default());

        let spec = selector.resolve("opencv_haar").unwrap();
        assert_eq!(spec.detectors, vec![DetectorFamily::Haar]);
        assert!(registry.detectors(&spec).is_err());
    }
}
