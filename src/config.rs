// Application configuration: defaults, optional JSON file, environment overrides

use crate::emotion::MIN_FACE_SIZE;
use crate::error::{EmotionStreamError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Names the JSON config file to read, if any.
pub const CONFIG_PATH_VAR: &str = "EMOTION_STREAM_CONFIG";

/// How the binary feeds frames to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The controller reads frames from the source itself.
    #[default]
    Pull,
    /// Frames are pushed through the per-frame callback, as a transport would.
    Push,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pull" => Ok(DeliveryMode::Pull),
            "push" => Ok(DeliveryMode::Push),
            other => Err(format!("unknown delivery mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub label_map_path: PathBuf,
    pub classifier_model_path: PathBuf,
    pub landmark_model_path: PathBuf,
    pub camera_index: u32,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Replay the images in this directory instead of opening a camera.
    pub input_dir: Option<PathBuf>,
    /// Where headless runs write annotated frames.
    pub output_dir: PathBuf,
    /// 0 disables pacing.
    pub target_fps: u32,
    /// Push-mode per-frame budget; `None` waits as long as a frame takes.
    pub frame_deadline_ms: Option<u64>,
    pub delivery: DeliveryMode,
    /// Write annotated frames to `output_dir` instead of opening a window.
    pub headless: bool,
    pub log_file: PathBuf,
    pub feedback_dir: PathBuf,
    pub caption_font: Option<PathBuf>,
    /// Faces with a shorter side than this are not classified.
    pub min_face_size: u32,
    pub face_presence_threshold: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            label_map_path: PathBuf::from("assets/models/labels.json"),
            classifier_model_path: PathBuf::from("assets/models/emotion.onnx"),
            landmark_model_path: PathBuf::from("assets/models/face_mesh.onnx"),
            camera_index: 0,
            capture_width: 640,
            capture_height: 480,
            input_dir: None,
            output_dir: PathBuf::from("output"),
            target_fps: 30,
            frame_deadline_ms: Some(200),
            delivery: DeliveryMode::Pull,
            headless: false,
            log_file: PathBuf::from("emotion_stream.log"),
            feedback_dir: PathBuf::from("feedback"),
            caption_font: None,
            min_face_size: MIN_FACE_SIZE,
            face_presence_threshold: 0.5,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EmotionStreamError::Config(format!("Invalid {key}: '{raw}'"))),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Defaults, then the file named by `EMOTION_STREAM_CONFIG` (if set),
    /// then `EMOTION_STREAM_*` variables. A `.env` file is read first.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EmotionStreamError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Applies `EMOTION_STREAM_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_LABELS")? {
            self.label_map_path = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_CLASSIFIER_MODEL")? {
            self.classifier_model_path = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_LANDMARK_MODEL")? {
            self.landmark_model_path = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_CAMERA_INDEX")? {
            self.camera_index = v;
        }
        if let Some(v) = parse_var::<PathBuf, _>(&lookup, "EMOTION_STREAM_INPUT_DIR")? {
            self.input_dir = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_OUTPUT_DIR")? {
            self.output_dir = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_TARGET_FPS")? {
            self.target_fps = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "EMOTION_STREAM_FRAME_DEADLINE_MS")? {
            self.frame_deadline_ms = (v > 0).then_some(v);
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_DELIVERY")? {
            self.delivery = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_HEADLESS")? {
            self.headless = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_LOG_FILE")? {
            self.log_file = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_FEEDBACK_DIR")? {
            self.feedback_dir = v;
        }
        if let Some(v) = parse_var::<PathBuf, _>(&lookup, "EMOTION_STREAM_CAPTION_FONT")? {
            self.caption_font = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_MIN_FACE_SIZE")? {
            self.min_face_size = v;
        }
        if let Some(v) = parse_var(&lookup, "EMOTION_STREAM_FACE_PRESENCE")? {
            self.face_presence_threshold = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_face_size == 0 {
            return Err(EmotionStreamError::Config(
                "min_face_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.face_presence_threshold) {
            return Err(EmotionStreamError::Config(
                "face_presence_threshold must be in [0, 1]".to_string(),
            ));
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            return Err(EmotionStreamError::Config(
                "capture size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn frame_deadline(&self) -> Option<Duration> {
        self.frame_deadline_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_face_size, 20);
        assert_eq!(config.delivery, DeliveryMode::Pull);
        assert_eq!(config.frame_deadline(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "camera_index": 2, "delivery": "push" }"#).unwrap();
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.delivery, DeliveryMode::Push);
        assert_eq!(config.target_fps, 30);
        assert_eq!(config.label_map_path, PathBuf::from("assets/models/labels.json"));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup(&[
                ("EMOTION_STREAM_INPUT_DIR", "frames"),
                ("EMOTION_STREAM_TARGET_FPS", " 15 "),
                ("EMOTION_STREAM_FRAME_DEADLINE_MS", "0"),
                ("EMOTION_STREAM_DELIVERY", "PUSH"),
                ("EMOTION_STREAM_HEADLESS", "true"),
            ]))
            .unwrap();
        assert_eq!(config.input_dir, Some(PathBuf::from("frames")));
        assert_eq!(config.target_fps, 15);
        assert_eq!(config.frame_deadline(), None);
        assert_eq!(config.delivery, DeliveryMode::Push);
        assert!(config.headless);
    }

    #[test]
    fn unparseable_override_is_a_config_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(lookup(&[("EMOTION_STREAM_CAMERA_INDEX", "front")]))
            .unwrap_err();
        assert!(matches!(err, EmotionStreamError::Config(_)));
    }

    #[test]
    fn zero_min_face_size_is_rejected() {
        let config = AppConfig {
            min_face_size: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = AppConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, EmotionStreamError::Config(_)));
    }
}
