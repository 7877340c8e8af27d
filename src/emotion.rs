// Per-frame emotion analysis: landmarks, face crop, classification, overlay

use crate::error::{FrameError, Result};
use crate::labels::LabelMap;
use crate::models::{
    BoundingBox, ClassProbabilities, EmotionReading, FaceTensor, Frame, LandmarkSet, Sentiment,
};
use crate::overlay::{Annotation, Annotator};
use crate::preprocess;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Faces whose box is narrower or shorter than this are ignored.
pub const MIN_FACE_SIZE: u32 = 20;

/// Finds one face in an RGB frame.
///
/// Implementations may keep tracking state between calls, which is why
/// detection takes `&mut self` and each session owns its own detector.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, frame: &Frame) -> std::result::Result<Option<LandmarkSet>, FrameError>;
}

/// Scores a face tensor against every emotion class.
///
/// Must be a pure function of the tensor for a given loaded model, so one
/// instance can be shared by every session.
pub trait Classifier: Send + Sync {
    fn predict(&self, tensor: &FaceTensor) -> std::result::Result<ClassProbabilities, FrameError>;

    /// Output length, when the model can report it up front.
    fn num_classes(&self) -> Option<usize> {
        None
    }
}

/// Label map and classifier, loaded once and shared read-only.
pub struct SharedModels {
    labels: LabelMap,
    classifier: Arc<dyn Classifier>,
}

impl SharedModels {
    /// Pairs a label map with a classifier, refusing the pair if the
    /// classifier reports a different class count.
    pub fn new(labels: LabelMap, classifier: Arc<dyn Classifier>) -> Result<Arc<Self>> {
        if let Some(outputs) = classifier.num_classes() {
            labels.check_class_count(outputs)?;
        }
        info!("Models ready with {} emotion classes", labels.len());
        Ok(Arc::new(Self { labels, classifier }))
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }
}

impl std::fmt::Debug for SharedModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedModels")
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// Running counters for one processor. Safe to read from other threads.
#[derive(Debug, Default)]
pub struct FrameStats {
    processed: AtomicU64,
    classified: AtomicU64,
    no_face: AtomicU64,
    degenerate: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`FrameStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub classified: u64,
    pub no_face: u64,
    pub degenerate: u64,
    pub failed: u64,
}

impl FrameStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            classified: self.classified.load(Ordering::Relaxed),
            no_face: self.no_face.load(Ordering::Relaxed),
            degenerate: self.degenerate.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Counts a frame that failed outside the processor (deadline, busy).
    pub fn record_failure(&self, error: &FrameError) {
        debug!("Frame dropped: {}", error);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: &FrameOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            FrameOutcome::Classified(_) => &self.classified,
            FrameOutcome::NoFace => &self.no_face,
            FrameOutcome::DegenerateRoi(_) => &self.degenerate,
            FrameOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Classified(EmotionReading),
    NoFace,
    /// A face was found but its box is below the minimum size.
    DegenerateRoi(BoundingBox),
    /// Detection or classification failed; the frame passed through.
    Failed(FrameError),
}

/// A frame after processing, annotated only when it was classified.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub frame: Frame,
    pub outcome: FrameOutcome,
    pub annotation: Option<Annotation>,
}

impl ProcessedFrame {
    /// The untouched input frame with a non-classified outcome.
    pub fn passthrough(frame: Frame, outcome: FrameOutcome) -> Self {
        Self {
            frame,
            outcome,
            annotation: None,
        }
    }

    pub fn reading(&self) -> Option<&EmotionReading> {
        match &self.outcome {
            FrameOutcome::Classified(reading) => Some(reading),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FrameError> {
        match &self.outcome {
            FrameOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

enum Analysis {
    NoFace,
    Degenerate(BoundingBox),
    Face {
        landmarks: LandmarkSet,
        reading: EmotionReading,
    },
}

/// Runs the full per-frame pipeline for one session.
pub struct FrameProcessor {
    detector: Box<dyn LandmarkDetector>,
    models: Arc<SharedModels>,
    annotator: Annotator,
    min_face_size: u32,
    stats: Arc<FrameStats>,
    result_sender: Option<broadcast::Sender<EmotionReading>>,
}

impl FrameProcessor {
    /// Creates a processor with its own detector and the shared models
    pub fn new(detector: Box<dyn LandmarkDetector>, models: Arc<SharedModels>) -> Self {
        Self {
            detector,
            models,
            annotator: Annotator::default(),
            min_face_size: MIN_FACE_SIZE,
            stats: Arc::new(FrameStats::default()),
            result_sender: None,
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_min_face_size(mut self, min_face_size: u32) -> Self {
        self.min_face_size = min_face_size.max(1);
        self
    }

    /// Publishes every reading on `sender` as well as returning it.
    pub fn with_result_sender(mut self, sender: broadcast::Sender<EmotionReading>) -> Self {
        self.result_sender = Some(sender);
        self
    }

    pub fn stats(&self) -> Arc<FrameStats> {
        self.stats.clone()
    }

    pub fn models(&self) -> &Arc<SharedModels> {
        &self.models
    }

    /// Processes one frame.
    ///
    /// Frames without a usable face, and frames whose analysis failed, come
    /// back byte-for-byte unchanged. Classified frames come back with the
    /// landmark mesh and caption drawn on them.
    pub fn process(&mut self, frame: Frame) -> ProcessedFrame {
        self.process_abandonable(frame, &AtomicBool::new(false))
    }

    /// [`process`](Self::process) for a frame whose caller may stop waiting.
    /// If `abandoned` is set by the time the frame is done, its outcome is
    /// neither counted nor published.
    pub fn process_abandonable(
        &mut self,
        frame: Frame,
        abandoned: &AtomicBool,
    ) -> ProcessedFrame {
        let processed = match self.analyze(&frame) {
            Ok(Analysis::NoFace) => ProcessedFrame::passthrough(frame, FrameOutcome::NoFace),
            Ok(Analysis::Degenerate(bbox)) => {
                debug!("Ignoring {}x{} face box", bbox.width(), bbox.height());
                ProcessedFrame::passthrough(frame, FrameOutcome::DegenerateRoi(bbox))
            }
            Ok(Analysis::Face { landmarks, reading }) => {
                let mut frame = frame;
                let annotation = self.annotator.annotate(&mut frame, &landmarks, &reading);
                ProcessedFrame {
                    frame,
                    outcome: FrameOutcome::Classified(reading),
                    annotation: Some(annotation),
                }
            }
            Err(e) => {
                warn!("Frame analysis failed: {}", e);
                ProcessedFrame::passthrough(frame, FrameOutcome::Failed(e))
            }
        };

        if abandoned.load(Ordering::SeqCst) {
            debug!("Discarding the outcome of an abandoned frame");
            return processed;
        }
        if let Some(reading) = processed.reading() {
            self.publish(reading);
        }
        self.stats.record(&processed.outcome);
        processed
    }

    fn analyze(&mut self, frame: &Frame) -> std::result::Result<Analysis, FrameError> {
        frame.check_well_formed()?;

        let rgb = frame.to_rgb();
        let Some(landmarks) = self.detector.detect(&rgb)? else {
            return Ok(Analysis::NoFace);
        };

        let Some(bbox) = BoundingBox::from_landmarks(&landmarks, frame.width, frame.height) else {
            return Ok(Analysis::NoFace);
        };
        if bbox.is_smaller_than(self.min_face_size) {
            return Ok(Analysis::Degenerate(bbox));
        }

        let tensor = preprocess::face_tensor(&rgb, &bbox)?;
        let probabilities = self.models.classifier().predict(&tensor)?;
        let reading = self.read(probabilities, bbox)?;

        Ok(Analysis::Face { landmarks, reading })
    }

    fn read(
        &self,
        probabilities: ClassProbabilities,
        face: BoundingBox,
    ) -> std::result::Result<EmotionReading, FrameError> {
        let labels = self.models.labels();
        if probabilities.len() != labels.len() {
            return Err(FrameError::ClassCountMismatch {
                labels: labels.len(),
                outputs: probabilities.len(),
            });
        }

        let label = probabilities
            .argmax()
            .and_then(|idx| labels.get(idx))
            .ok_or_else(|| {
                FrameError::Classification("no finite class probability".to_string())
            })?
            .to_string();

        Ok(EmotionReading {
            sentiment: Sentiment::from_label(&label),
            label,
            probabilities,
            face,
        })
    }

    fn publish(&self, reading: &EmotionReading) {
        if let Some(sender) = &self.result_sender {
            // No subscribers is fine; the UI may not be listening yet.
            let _ = sender.send(reading.clone());
        }
    }
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("models", &self.models)
            .field("min_face_size", &self.min_face_size)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::error::EmotionStreamError;
    use crate::models::PixelOrder;

    fn gray_frame() -> Frame {
        Frame::filled(200, 200, [90, 90, 90], PixelOrder::Bgr)
    }

    #[test]
    fn no_face_passes_frame_through() {
        let mut processor = processor(None, vec![0.7, 0.1, 0.2]);
        let input = gray_frame();
        let out = processor.process(input.clone());
        assert_eq!(out.frame, input);
        assert_eq!(out.outcome, FrameOutcome::NoFace);
        assert!(out.reading().is_none());
        assert_eq!(processor.stats().snapshot().no_face, 1);
    }

    #[test]
    fn small_face_passes_frame_through() {
        // 200 * 0.09 = 18 px wide
        let mut processor = processor(Some(square(0.5, 0.2, 0.59, 0.8)), vec![0.7, 0.1, 0.2]);
        let input = gray_frame();
        let out = processor.process(input.clone());
        assert_eq!(out.frame, input);
        assert!(matches!(out.outcome, FrameOutcome::DegenerateRoi(b) if b.width() < 20));
        assert!(out.reading().is_none());
    }

    #[test]
    fn twenty_pixel_face_is_accepted() {
        let mut processor = processor(Some(square(0.5, 0.5, 0.6, 0.6)), vec![0.1, 0.7, 0.2]);
        let out = processor.process(gray_frame());
        let reading = out.reading().expect("20x20 face should be classified");
        assert_eq!(reading.face.width(), 20);
        assert_eq!(reading.label, "Sad");
        assert_eq!(reading.sentiment, Sentiment::Negative);
    }

    #[test]
    fn classifies_and_annotates() {
        let (tx, mut rx) = broadcast::channel(4);
        let mut processor =
            processor(Some(square(0.25, 0.25, 0.75, 0.75)), vec![0.7, 0.1, 0.2])
                .with_result_sender(tx);
        let input = gray_frame();
        let out = processor.process(input.clone());

        let reading = out.reading().unwrap();
        assert_eq!(reading.label, "Happy");
        assert_eq!(reading.sentiment, Sentiment::Positive);
        assert_ne!(out.frame, input);
        assert_eq!(out.annotation.as_ref().unwrap().caption, "Positive (Happy)");
        assert_eq!(rx.try_recv().unwrap(), *reading);
    }

    #[test]
    fn classifier_sees_normalized_tensor() {
        let classifier = Arc::new(FixedClassifier::new(vec![0.2, 0.2, 0.6]));
        let models = SharedModels::new(labels(), classifier.clone()).unwrap();
        let mut processor = FrameProcessor::new(
            Box::new(FixedDetector(Some(square(0.1, 0.1, 0.9, 0.9)))),
            models,
        );
        processor.process(Frame::filled(100, 100, [255, 255, 255], PixelOrder::Rgb));

        let tensor = classifier.last_tensor.lock().unwrap().clone().unwrap();
        assert_eq!(tensor.shape(), &[1, 48, 48, 1]);
        assert!(tensor.as_array().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn tie_goes_to_first_label() {
        let mut processor = processor(Some(square(0.25, 0.25, 0.75, 0.75)), vec![0.5, 0.5, 0.0]);
        let out = processor.process(gray_frame());
        assert_eq!(out.reading().unwrap().label, "Happy");
    }

    #[test]
    fn detector_failure_is_absorbed() {
        let classifier = Arc::new(FixedClassifier::new(vec![0.7, 0.1, 0.2]));
        let models = SharedModels::new(labels(), classifier).unwrap();
        let mut processor = FrameProcessor::new(Box::new(FailingDetector), models);
        let input = gray_frame();
        let out = processor.process(input.clone());
        assert_eq!(out.frame, input);
        assert!(matches!(out.error(), Some(FrameError::Detection(_))));
        assert_eq!(processor.stats().snapshot().failed, 1);

        // The processor keeps working afterwards.
        processor.process(gray_frame());
        assert_eq!(processor.stats().snapshot().processed, 2);
    }

    #[test]
    fn classifier_failure_is_absorbed() {
        let models = SharedModels::new(labels(), Arc::new(FailingClassifier)).unwrap();
        let (tx, mut rx) = broadcast::channel(4);
        let mut processor = FrameProcessor::new(
            Box::new(FixedDetector(Some(square(0.25, 0.25, 0.75, 0.75)))),
            models,
        )
        .with_result_sender(tx);

        let input = gray_frame();
        let out = processor.process(input.clone());
        assert_eq!(out.frame, input);
        assert!(out.annotation.is_none());
        assert_eq!(
            out.outcome,
            FrameOutcome::Failed(FrameError::Classification("inference failed".to_string()))
        );
        assert!(rx.try_recv().is_err());

        let next = processor.process(gray_frame());
        assert!(matches!(next.error(), Some(FrameError::Classification(_))));
        let stats = processor.stats().snapshot();
        assert_eq!((stats.processed, stats.failed, stats.classified), (2, 2, 0));
    }

    #[test]
    fn abandoned_frame_leaves_no_trace() {
        let (tx, mut rx) = broadcast::channel(4);
        let mut processor =
            processor(Some(square(0.25, 0.25, 0.75, 0.75)), vec![0.7, 0.1, 0.2])
                .with_result_sender(tx);

        let out = processor.process_abandonable(gray_frame(), &AtomicBool::new(true));
        assert_eq!(out.reading().map(|r| r.label.as_str()), Some("Happy"));
        assert_eq!(processor.stats().snapshot(), StatsSnapshot::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wrong_output_length_is_a_frame_failure() {
        let classifier = Arc::new(FixedClassifier {
            declared: None,
            ..FixedClassifier::new(vec![0.5, 0.5])
        });
        let models = SharedModels::new(labels(), classifier).unwrap();
        let mut processor = FrameProcessor::new(
            Box::new(FixedDetector(Some(square(0.25, 0.25, 0.75, 0.75)))),
            models,
        );
        let input = gray_frame();
        let out = processor.process(input.clone());
        assert_eq!(out.frame, input);
        assert_eq!(
            out.outcome,
            FrameOutcome::Failed(FrameError::ClassCountMismatch {
                labels: 3,
                outputs: 2
            })
        );
    }

    #[test]
    fn startup_rejects_mismatched_models() {
        let classifier = Arc::new(FixedClassifier::new(vec![0.1; 7]));
        assert!(matches!(
            SharedModels::new(labels(), classifier),
            Err(EmotionStreamError::ClassCountMismatch {
                labels: 3,
                outputs: 7
            })
        ));
    }

    #[test]
    fn malformed_frame_is_a_frame_failure() {
        let mut processor = processor(Some(square(0.25, 0.25, 0.75, 0.75)), vec![0.7, 0.1, 0.2]);
        let frame = Frame::new(vec![1, 2, 3], 200, 200);
        let out = processor.process(frame.clone());
        assert!(matches!(out.error(), Some(FrameError::MalformedFrame(_))));

        // Cropping reports the same error as the processor.
        let bbox = BoundingBox {
            x1: 0,
            y1: 0,
            x2: 50,
            y2: 50,
        };
        assert_eq!(
            out.error().cloned(),
            preprocess::crop_gray(&frame, &bbox).err()
        );
    }
}
