//! facematch-core — face detection ensemble and embedding matching.
//!
//! Several detector backends vote on face locations, one encoder embeds the
//! merged boxes, and the matcher scores query embeddings against stored
//! galleries. Backends run via ONNX Runtime, except the cascade detector.

pub mod alignment;
pub mod analysis;
pub mod arcface;
pub mod cascade;
pub mod classical;
pub mod config;
pub mod dedup;
pub mod detector;
pub mod distance;
pub mod encoder;
pub mod engine;
pub mod matcher;
pub mod merge;
pub mod preprocess;
pub mod registry;
pub mod retinaface;
pub mod scrfd;
pub mod selector;
pub mod status;
pub mod types;
pub mod ultraface;

pub use config::EngineConfig;
pub use detector::{DetectOptions, DetectorFamily, FaceDetector};
pub use encoder::{EncoderFamily, FaceEncoder};
pub use engine::{EngineError, FaceEngine, ProcessedImage};
pub use matcher::{FaceMatcher, PhotoMatch};
pub use registry::ModelRegistry;
pub use selector::{ModelSelector, PipelineKind, PipelineSpec, Runtime, RuntimeCatalog};
pub use status::ProcessingStatus;
pub use types::{BoundingBox, Embedding, EncodingSet, MatchCandidate};
