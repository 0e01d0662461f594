//! Engine worker: the engine lives on a dedicated OS thread and is driven
//! through a channel, so slow inference never blocks the async runtime.

use chrono::{DateTime, Utc};
use facematch_core::status::StatusError;
use facematch_core::{EncodingSet, EngineError, FaceEngine, ProcessedImage, ProcessingStatus};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct ProcessRequest {
    bytes: Vec<u8>,
    /// Fired when the engine thread picks the request up.
    started: oneshot::Sender<()>,
    reply: oneshot::Sender<Result<ProcessedImage, EngineError>>,
}

/// Outcome of one photo, as handed to whoever persists it.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoReport {
    pub photo: String,
    #[serde(flatten)]
    pub status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encodings: Option<EncodingSet>,
    pub finished_at: DateTime<Utc>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ProcessRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Run one image through the engine, giving up after the handle's timeout.
    ///
    /// The timeout counts from when the engine starts on the image, so time
    /// spent queued behind other photos is not charged to this one.
    pub async fn process(&self, bytes: Vec<u8>) -> Result<ProcessedImage, WorkerError> {
        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ProcessRequest {
                bytes,
                started: started_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;

        started_rx.await.map_err(|_| WorkerError::ChannelClosed)?;
        let reply = tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| WorkerError::Timeout(self.timeout))?;
        Ok(reply.map_err(|_| WorkerError::ChannelClosed)??)
    }

    /// Drive one photo through `pending → processing → completed | failed`.
    pub async fn process_photo(&self, photo: &str, bytes: Vec<u8>) -> Result<PhotoReport, StatusError> {
        let status = ProcessingStatus::Pending.start()?;
        tracing::debug!(photo, "processing photo");

        let (status, encodings) = match self.process(bytes).await {
            Ok(processed) => (status.complete(processed.face_count)?, Some(processed.encodings)),
            Err(e) => {
                tracing::warn!(photo, error = %e, "photo processing failed");
                (status.fail(e.to_string())?, None)
            }
        };

        Ok(PhotoReport::new(photo, status, encodings))
    }
}

impl PhotoReport {
    fn new(photo: &str, status: ProcessingStatus, encodings: Option<EncodingSet>) -> Self {
        Self {
            photo: photo.to_string(),
            status,
            encodings,
            finished_at: Utc::now(),
        }
    }
}

/// Report for a photo that never reached the engine.
pub fn failed_report(photo: &str, reason: String) -> Result<PhotoReport, StatusError> {
    let status = ProcessingStatus::Pending.start()?.fail(reason)?;
    Ok(PhotoReport::new(photo, status, None))
}

/// Move `engine` onto its own thread and return a handle to it.
pub fn spawn_engine(engine: FaceEngine, timeout: Duration) -> Result<EngineHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<ProcessRequest>(QUEUE_DEPTH);
    let pipeline = engine.spec().kind;

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!(%pipeline, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                if req.reply.is_closed() || req.started.send(()).is_err() {
                    tracing::debug!("caller gone, skipping queued photo");
                    continue;
                }
                let result = engine.process_image(&req.bytes);
                // The caller may have timed out and dropped the receiver.
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facematch_core::detector::DetectorError;
    use facematch_core::encoder::EncoderError;
    use facematch_core::{
        BoundingBox, DetectOptions, DetectorFamily, EncoderFamily, FaceDetector, FaceEncoder, PipelineKind,
        PipelineSpec,
    };
    use facematch_core::Embedding;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    struct SlowDetector(Duration, Vec<BoundingBox>);

    impl FaceDetector for SlowDetector {
        fn family(&self) -> DetectorFamily {
            DetectorFamily::Hog
        }

        fn detect(&self, _: &image::RgbImage, _: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError> {
            std::thread::sleep(self.0);
            Ok(self.1.clone())
        }
    }

    struct ConstEncoder;

    impl FaceEncoder for ConstEncoder {
        fn family(&self) -> EncoderFamily {
            EncoderFamily::Classical
        }

        fn encode(&self, _: &image::RgbImage, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError> {
            Ok(boxes.iter().map(|_| Embedding::new(vec![0.5; 128])).collect())
        }
    }

    /// Sleeps on its first call only.
    struct SlowOnce {
        delay: Duration,
        fired: AtomicBool,
    }

    impl FaceDetector for SlowOnce {
        fn family(&self) -> DetectorFamily {
            DetectorFamily::Hog
        }

        fn detect(&self, _: &image::RgbImage, _: &DetectOptions) -> Result<Vec<BoundingBox>, DetectorError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                std::thread::sleep(self.delay);
            }
            Ok(vec![BoundingBox::new(10, 60, 60, 10)])
        }
    }

    fn engine(delay: Duration, boxes: Vec<BoundingBox>) -> FaceEngine {
        engine_with(Arc::new(SlowDetector(delay, boxes)))
    }

    fn engine_with(detector: Arc<dyn FaceDetector>) -> FaceEngine {
        let spec = PipelineSpec {
            kind: PipelineKind::Single(DetectorFamily::Hog),
            detectors: vec![DetectorFamily::Hog],
            encoder: EncoderFamily::Classical,
            crop_per_box: false,
            upsample: 1,
            jitters: 1,
            iou_threshold: 0.5,
            enhance: false,
            max_faces: 30,
        };
        FaceEngine::new(spec, vec![detector], Arc::new(ConstEncoder))
    }

    #[tokio::test]
    async fn test_completed_photo_carries_face_count() {
        let handle = spawn_engine(
            engine(Duration::ZERO, vec![BoundingBox::new(10, 60, 60, 10)]),
            Duration::from_secs(10),
        )
        .unwrap();
        let report = handle.process_photo("p1", png(480, 480)).await.unwrap();
        assert_eq!(report.status, ProcessingStatus::Completed { face_count: 1 });
        assert_eq!(report.encodings.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_faces_still_completes() {
        let handle = spawn_engine(engine(Duration::ZERO, Vec::new()), Duration::from_secs(10)).unwrap();
        let report = handle.process_photo("empty", png(480, 480)).await.unwrap();
        assert_eq!(report.status, ProcessingStatus::Completed { face_count: 0 });
    }

    #[tokio::test]
    async fn test_invalid_bytes_fail_photo() {
        let handle = spawn_engine(engine(Duration::ZERO, Vec::new()), Duration::from_secs(10)).unwrap();
        let report = handle.process_photo("junk", b"not an image".to_vec()).await.unwrap();
        assert!(matches!(report.status, ProcessingStatus::Failed { .. }));
        assert!(report.encodings.is_none());
    }

    #[tokio::test]
    async fn test_timeout_marks_photo_failed() {
        let handle = spawn_engine(
            engine(Duration::from_millis(500), Vec::new()),
            Duration::from_millis(20),
        )
        .unwrap();
        let report = handle.process_photo("slow", png(480, 480)).await.unwrap();
        match report.status {
            ProcessingStatus::Failed { reason } => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("expected failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_timed_out_photo_does_not_fail_the_next() {
        let detector = Arc::new(SlowOnce {
            delay: Duration::from_millis(800),
            fired: AtomicBool::new(false),
        });
        let handle = spawn_engine(engine_with(detector), Duration::from_millis(300)).unwrap();

        let slow = handle.process_photo("slow", png(480, 480)).await.unwrap();
        assert!(matches!(slow.status, ProcessingStatus::Failed { .. }));
        // Queued while the engine thread is still busy with the slow photo.
        let fast = handle.process_photo("fast", png(480, 480)).await.unwrap();
        assert_eq!(fast.status, ProcessingStatus::Completed { face_count: 1 });
    }

    #[test]
    fn test_failed_report_has_reason() {
        let report = failed_report("gone.jpg", "cannot read file".into()).unwrap();
        assert_eq!(report.status, ProcessingStatus::Failed { reason: "cannot read file".into() });
        assert!(report.encodings.is_none());
    }

    #[test]
    fn test_report_serializes_flat_status() {
        let report = PhotoReport {
            photo: "p".into(),
            status: ProcessingStatus::Completed { face_count: 0 },
            encodings: Some(EncodingSet::default()),
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["face_count"], 0);
        assert_eq!(json["encodings"], serde_json::json!([]));
    }
}
