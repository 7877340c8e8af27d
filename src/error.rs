// Error types for the emotion stream

use thiserror::Error;

/// Startup and session level errors.
///
/// Anything in here either prevents a session from starting (bad config,
/// missing model, label map out of step with the classifier) or ends the
/// current one (the frame source went away).
#[derive(Debug, Error)]
pub enum EmotionStreamError {
    #[error("Camera initialization failed: {0}")]
    CameraInit(String),

    #[error("Frame source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Invalid label map: {0}")]
    LabelMap(String),

    #[error("Label map has {labels} classes but the classifier produces {outputs}")]
    ClassCountMismatch { labels: usize, outputs: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for emotion stream operations
pub type Result<T> = std::result::Result<T, EmotionStreamError>;

/// Failures confined to a single frame.
///
/// The frame processor absorbs these: the frame passes through unannotated,
/// the failure is counted and logged, and the session keeps going.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("Landmark detection failed: {0}")]
    Detection(String),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed input tensor: {0}")]
    InvalidTensor(String),

    #[error("Classifier returned {outputs} probabilities for {labels} labels")]
    ClassCountMismatch { labels: usize, outputs: usize },

    #[error("Frame processing exceeded the {0:?} deadline")]
    DeadlineExceeded(std::time::Duration),

    #[error("Previous frame still in flight")]
    Busy,
}

/// Errors from the feedback log.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("The {0} field is empty")]
    EmptyField(&'static str),

    #[error("{} does not exist", .0.display())]
    Missing(std::path::PathBuf),

    #[error("Feedback file error: {0}")]
    Io(#[from] std::io::Error),
}

// Conversion from nokhwa errors
#[cfg(feature = "camera")]
impl From<nokhwa::NokhwaError> for EmotionStreamError {
    fn from(err: nokhwa::NokhwaError) -> Self {
        match err {
            nokhwa::NokhwaError::StructureError { structure, error } => {
                EmotionStreamError::CameraInit(format!("{structure}: {error}"))
            }
            nokhwa::NokhwaError::OpenDeviceError(device, error) => {
                EmotionStreamError::CameraInit(format!("Device {device}: {error}"))
            }
            nokhwa::NokhwaError::ReadFrameError(error) => {
                EmotionStreamError::SourceUnavailable(error)
            }
            _ => EmotionStreamError::CameraInit(err.to_string()),
        }
    }
}

// Conversion from ONNX Runtime errors
#[cfg(feature = "onnx")]
impl From<ort::Error> for EmotionStreamError {
    fn from(err: ort::Error) -> Self {
        EmotionStreamError::OnnxRuntime(err.to_string())
    }
}
