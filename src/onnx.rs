// ONNX Runtime adapters for the classifier and the face landmark model

use crate::emotion::{Classifier, LandmarkDetector};
use crate::error::{EmotionStreamError, FrameError, Result};
use crate::models::{ClassProbabilities, FaceTensor, Frame, Landmark, LandmarkSet};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, info};

fn load_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(EmotionStreamError::ModelLoad(format!(
            "Model not found at {}",
            model_path.display()
        )));
    }

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)
        .map_err(|e| {
            error!("Failed to load ONNX model {}: {}", model_path.display(), e);
            EmotionStreamError::ModelLoad(format!("ONNX model load failed: {e}"))
        })?;
    info!("Loaded ONNX model {}", model_path.display());
    Ok(session)
}

/// Softmax, applied only when the output is not already a distribution.
fn to_probabilities(raw: &[f32]) -> Vec<f32> {
    if raw.iter().all(|v| (0.0..=1.0).contains(v)) {
        return raw.to_vec();
    }
    let max_logit = raw.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum: f32 = raw.iter().map(|&x| (x - max_logit).exp()).sum();
    raw.iter().map(|&x| (x - max_logit).exp() / exp_sum).collect()
}

/// Emotion classifier over a `(1, 48, 48, 1)` grayscale input.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    classes: usize,
}

impl OnnxClassifier {
    /// Loads the model and runs it once on a blank face to learn how many
    /// classes it produces.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = load_session(model_path.as_ref())?;
        let mut classifier = Self {
            session: Mutex::new(session),
            classes: 0,
        };

        let blank = FaceTensor::from_array(Array4::zeros(FaceTensor::SHAPE))
            .map_err(|e| EmotionStreamError::ModelLoad(e.to_string()))?;
        let warmup = classifier
            .run(&blank)
            .map_err(|e| EmotionStreamError::ModelLoad(format!("Warm-up inference failed: {e}")))?;
        classifier.classes = warmup.len();
        info!("Classifier produces {} classes", classifier.classes);
        Ok(classifier)
    }

    fn run(&self, tensor: &FaceTensor) -> std::result::Result<ClassProbabilities, FrameError> {
        let data = tensor.as_array().iter().copied().collect::<Vec<f32>>();
        let input = Tensor::from_array((FaceTensor::SHAPE.to_vec(), data.into_boxed_slice()))
            .map_err(|e| FrameError::Classification(format!("Failed to create input tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| FrameError::Classification("ONNX session poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| FrameError::Classification(format!("Inference failed: {e}")))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| FrameError::Classification("No output from model".to_string()))?;
        let (_, raw) = output.try_extract_tensor::<f32>().map_err(|e| {
            FrameError::Classification(format!("Failed to extract output tensor: {e}"))
        })?;

        Ok(ClassProbabilities::new(to_probabilities(raw)))
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, tensor: &FaceTensor) -> std::result::Result<ClassProbabilities, FrameError> {
        self.run(tensor)
    }

    fn num_classes(&self) -> Option<usize> {
        Some(self.classes)
    }
}

/// Side length of the face mesh model input.
const MESH_INPUT_SIZE: u32 = 192;
const MESH_POINTS: usize = 468;

/// Outline of the face, a closed ring.
pub const FACE_OVAL: &[(usize, usize)] = &[
    (10, 338), (338, 297), (297, 332), (332, 284), (284, 251), (251, 389),
    (389, 356), (356, 454), (454, 323), (323, 361), (361, 288), (288, 397),
    (397, 365), (365, 379), (379, 378), (378, 400), (400, 377), (377, 152),
    (152, 148), (148, 176), (176, 149), (149, 150), (150, 136), (136, 172),
    (172, 58), (58, 132), (132, 93), (93, 234), (234, 127), (127, 162),
    (162, 21), (21, 54), (54, 103), (103, 67), (67, 109), (109, 10),
];

/// Outer and inner lip lines, each drawn from mouth corner to mouth corner.
pub const LIPS: &[(usize, usize)] = &[
    (61, 146), (146, 91), (91, 181), (181, 84), (84, 17),
    (17, 314), (314, 405), (405, 321), (321, 375), (375, 291),
    (61, 185), (185, 40), (40, 39), (39, 37), (37, 0),
    (0, 267), (267, 269), (269, 270), (270, 409), (409, 291),
    (78, 95), (95, 88), (88, 178), (178, 87), (87, 14),
    (14, 317), (317, 402), (402, 318), (318, 324), (324, 308),
    (78, 191), (191, 80), (80, 81), (81, 82), (82, 13),
    (13, 312), (312, 311), (311, 310), (310, 415), (415, 308),
];

pub const LEFT_EYE: &[(usize, usize)] = &[
    (263, 249), (249, 390), (390, 373), (373, 374), (374, 380), (380, 381), (381, 382), (382, 362),
    (263, 466), (466, 388), (388, 387), (387, 386), (386, 385), (385, 384), (384, 398), (398, 362),
];

pub const LEFT_EYEBROW: &[(usize, usize)] = &[
    (276, 283), (283, 282), (282, 295), (295, 285),
    (300, 293), (293, 334), (334, 296), (296, 336),
];

pub const RIGHT_EYE: &[(usize, usize)] = &[
    (33, 7), (7, 163), (163, 144), (144, 145), (145, 153), (153, 154), (154, 155), (155, 133),
    (33, 246), (246, 161), (161, 160), (160, 159), (159, 158), (158, 157), (157, 173), (173, 133),
];

pub const RIGHT_EYEBROW: &[(usize, usize)] = &[
    (46, 53), (53, 52), (52, 65), (65, 55),
    (70, 63), (63, 105), (105, 66), (66, 107),
];

const CONTOUR_PARTS: [&[(usize, usize)]; 6] =
    [FACE_OVAL, LIPS, LEFT_EYE, LEFT_EYEBROW, RIGHT_EYE, RIGHT_EYEBROW];

const fn edge_count(parts: &[&[(usize, usize)]]) -> usize {
    let mut total = 0;
    let mut p = 0;
    while p < parts.len() {
        total += parts[p].len();
        p += 1;
    }
    total
}

const fn join<const N: usize>(parts: &[&[(usize, usize)]]) -> [(usize, usize); N] {
    let mut out = [(0, 0); N];
    let mut i = 0;
    let mut p = 0;
    while p < parts.len() {
        let mut e = 0;
        while e < parts[p].len() {
            out[i] = parts[p][e];
            i += 1;
            e += 1;
        }
        p += 1;
    }
    out
}

/// Every contour edge: face oval, lips, eyes and eyebrows.
pub static FACE_CONTOURS: [(usize, usize); edge_count(&CONTOUR_PARTS)] =
    join(&CONTOUR_PARTS);

/// MediaPipe face mesh landmark model.
///
/// # Input requirement
///
/// The mesh model expects a face-centered crop, the output of a face
/// detector. No detector runs here: the whole frame is squashed to 192x192
/// and handed to the model as if it were that crop. Landmarks are only
/// trustworthy when the face fills most of the frame, as in a close webcam
/// shot or a pre-cropped image directory. On wide shots the presence gate may
/// reject the frame, or the model may return a misplaced box.
///
/// Returned landmark sets carry [`FACE_CONTOURS`] as their connections.
pub struct OnnxFaceMesh {
    session: Session,
    presence_threshold: f32,
}

impl OnnxFaceMesh {
    pub fn load<P: AsRef<Path>>(model_path: P, presence_threshold: f32) -> Result<Self> {
        Ok(Self {
            session: load_session(model_path.as_ref())?,
            presence_threshold,
        })
    }

    /// `(1, 3, 192, 192)` tensor scaled to [-1, 1].
    fn input_tensor(rgb: &Frame) -> std::result::Result<Value, FrameError> {
        let image = RgbImage::from_raw(rgb.width, rgb.height, rgb.data.clone())
            .ok_or_else(|| FrameError::Detection("frame buffer does not match its size".to_string()))?;
        let resized = imageops::resize(&image, MESH_INPUT_SIZE, MESH_INPUT_SIZE, FilterType::Triangle);

        let side = MESH_INPUT_SIZE as usize;
        let mut chw = Vec::with_capacity(3 * side * side);
        for c in 0..3 {
            for pixel in resized.pixels() {
                chw.push(pixel[c] as f32 / 255.0 * 2.0 - 1.0);
            }
        }

        Tensor::from_array((vec![1usize, 3, side, side], chw.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| FrameError::Detection(format!("Failed to create input tensor: {e}")))
    }
}

impl LandmarkDetector for OnnxFaceMesh {
    fn detect(&mut self, rgb: &Frame) -> std::result::Result<Option<LandmarkSet>, FrameError> {
        let input = Self::input_tensor(rgb)?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| FrameError::Detection(format!("Inference failed: {e}")))?;

        let mut coords: Option<Vec<f32>> = None;
        let mut presence: Option<f32> = None;
        for (name, value) in outputs.iter() {
            let (_, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| FrameError::Detection(format!("Failed to extract {name}: {e}")))?;
            if data.len() >= MESH_POINTS * 3 && coords.is_none() {
                coords = Some(data.to_vec());
            } else if data.len() == 1 {
                presence = Some(data[0]);
            }
        }

        // The presence head may emit a logit.
        let presence = presence.map(|p| {
            if (0.0..=1.0).contains(&p) {
                p
            } else {
                1.0 / (1.0 + (-p).exp())
            }
        });
        if presence.is_some_and(|p| p < self.presence_threshold) {
            debug!("Face presence {:?} below threshold", presence);
            return Ok(None);
        }

        let coords = coords
            .ok_or_else(|| FrameError::Detection("model returned no landmarks".to_string()))?;
        let stride = coords.len() / MESH_POINTS;
        let scale = MESH_INPUT_SIZE as f32;
        let points = (0..MESH_POINTS)
            .map(|i| Landmark {
                x: coords[i * stride] / scale,
                y: coords[i * stride + 1] / scale,
            })
            .collect();

        Ok(Some(LandmarkSet::new(points).with_connections(&FACE_CONTOURS)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probabilities_pass_through_untouched() {
        assert_eq!(to_probabilities(&[0.7, 0.1, 0.2]), vec![0.7, 0.1, 0.2]);
    }

    #[test]
    fn logits_are_softmaxed() {
        let probs = to_probabilities(&[2.0, -1.0, 0.5]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(probs[0] > probs[2] && probs[2] > probs[1]);
    }

    #[test]
    fn face_oval_is_a_closed_ring() {
        assert_eq!(FACE_OVAL.first().map(|c| c.0), FACE_OVAL.last().map(|c| c.1));
        assert!(FACE_OVAL.windows(2).all(|w| w[0].1 == w[1].0));
    }

    #[test]
    fn contours_cover_every_feature() {
        assert_eq!(FACE_CONTOURS.len(), 124);
        assert!(FACE_CONTOURS
            .iter()
            .all(|&(a, b)| a < MESH_POINTS && b < MESH_POINTS && a != b));
        for part in CONTOUR_PARTS {
            assert!(part.iter().all(|edge| FACE_CONTOURS.contains(edge)));
        }

        let mut edges: Vec<_> = FACE_CONTOURS
            .iter()
            .map(|&(a, b)| (a.min(b), a.max(b)))
            .collect();
        edges.sort_unstable();
        edges.dedup();
        assert_eq!(edges.len(), FACE_CONTOURS.len());
    }

    #[test]
    fn missing_model_is_a_load_error() {
        assert!(matches!(
            OnnxClassifier::load("/no/such/model.onnx"),
            Err(EmotionStreamError::ModelLoad(_))
        ));
    }
}
