// Library exports for emotion-stream: real-time facial emotion analysis over a frame stream

pub mod config;
pub mod emotion;
pub mod error;
pub mod feedback;
pub mod labels;
pub mod models;
pub mod overlay;
pub mod preprocess;
pub mod session;
pub mod source;
pub mod stream;

#[cfg(feature = "camera")]
pub mod camera;
#[cfg(feature = "onnx")]
pub mod onnx;
#[cfg(feature = "gui")]
pub mod ui;

pub use emotion::{FrameOutcome, FrameProcessor, ProcessedFrame, SharedModels};
pub use error::{EmotionStreamError, FrameError, Result};
pub use models::{map_to_category, EmotionReading, Frame, Sentiment};
pub use session::SessionState;
pub use stream::{PushSession, StreamController};
