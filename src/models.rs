// Core data models for the emotion stream

use crate::error::FrameError;
use ndarray::Array4;
use std::borrow::Cow;

/// Side length of the square grayscale patch the classifier consumes.
pub const FACE_INPUT_SIZE: usize = 48;

/// Channel order of a frame's interleaved pixel data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PixelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// A single video frame with 8-bit, 3-channel interleaved pixel data
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Raw pixel data (width * height * 3 bytes)
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Channel order of `data`
    pub order: PixelOrder,
}

impl Frame {
    /// Creates a new RGB Frame
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::with_order(data, width, height, PixelOrder::Rgb)
    }

    /// Creates a new Frame with an explicit channel order
    pub fn with_order(data: Vec<u8>, width: u32, height: u32, order: PixelOrder) -> Self {
        Self {
            data,
            width,
            height,
            order,
        }
    }

    /// Creates a frame where every pixel is `rgb`, stored in `order`.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], order: PixelOrder) -> Self {
        let pixel = match order {
            PixelOrder::Rgb => rgb,
            PixelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
        };
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::with_order(data, width, height, order)
    }

    /// Fails unless the buffer length matches the declared dimensions.
    pub fn check_well_formed(&self) -> Result<(), FrameError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() == expected {
            Ok(())
        } else {
            Err(FrameError::MalformedFrame(format!(
                "{} bytes for a {}x{} frame, expected {}",
                self.data.len(),
                self.width,
                self.height,
                expected
            )))
        }
    }

    /// Pixel at (x, y) as `[r, g, b]`, regardless of storage order.
    ///
    /// Panics if the coordinates are outside the frame.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        let px = &self.data[idx..idx + 3];
        match self.order {
            PixelOrder::Rgb => [px[0], px[1], px[2]],
            PixelOrder::Bgr => [px[2], px[1], px[0]],
        }
    }

    /// Borrows the frame if it is already RGB, otherwise returns a swapped copy.
    pub fn to_rgb(&self) -> Cow<'_, Frame> {
        match self.order {
            PixelOrder::Rgb => Cow::Borrowed(self),
            PixelOrder::Bgr => {
                let mut data = self.data.clone();
                for px in data.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                Cow::Owned(Frame::with_order(
                    data,
                    self.width,
                    self.height,
                    PixelOrder::Rgb,
                ))
            }
        }
    }
}

/// One facial keypoint, normalized to the frame: (0, 0) is the top-left
/// corner and (1, 1) the bottom-right.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Pixel position in a `width` x `height` frame (truncating, may lie
    /// outside the frame).
    pub fn to_pixel(self, width: u32, height: u32) -> (i32, i32) {
        ((self.x * width as f32) as i32, (self.y * height as f32) as i32)
    }
}

/// Landmarks of exactly one detected face, plus the mesh edges the detector
/// wants drawn between them.
#[derive(Clone, Debug, PartialEq)]
pub struct LandmarkSet {
    pub points: Vec<Landmark>,
    pub connections: &'static [(usize, usize)],
}

impl LandmarkSet {
    pub fn new(points: Vec<Landmark>) -> Self {
        Self {
            points,
            connections: &[],
        }
    }

    pub fn with_connections(mut self, connections: &'static [(usize, usize)]) -> Self {
        self.connections = connections;
        self
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All points in pixel space of a `width` x `height` frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> Vec<(i32, i32)> {
        self.points
            .iter()
            .map(|p| p.to_pixel(width, height))
            .collect()
    }
}

/// Axis-aligned face box in pixels, clamped to the frame.
///
/// Always satisfies `0 <= x1 <= x2 <= width` and `0 <= y1 <= y2 <= height`;
/// `x2`/`y2` are exclusive when used as crop bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Min/max over the landmark pixel coordinates, clamped to the frame.
    /// Returns `None` for an empty landmark set.
    pub fn from_landmarks(landmarks: &LandmarkSet, width: u32, height: u32) -> Option<Self> {
        let pixels = landmarks.to_pixels(width, height);
        let min_x = pixels.iter().map(|p| p.0).min()?;
        let max_x = pixels.iter().map(|p| p.0).max()?;
        let min_y = pixels.iter().map(|p| p.1).min()?;
        let max_y = pixels.iter().map(|p| p.1).max()?;

        let clamp_x = |v: i32| v.clamp(0, width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, height as i32) as u32;

        Some(Self {
            x1: clamp_x(min_x),
            y1: clamp_y(min_y),
            x2: clamp_x(max_x),
            y2: clamp_y(max_y),
        })
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// True when either side is shorter than `min_side` pixels.
    pub fn is_smaller_than(&self, min_side: u32) -> bool {
        self.width() < min_side || self.height() < min_side
    }
}

/// Classifier input: a (1, 48, 48, 1) grayscale patch with values in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct FaceTensor(Array4<f32>);

impl FaceTensor {
    pub const SHAPE: [usize; 4] = [1, FACE_INPUT_SIZE, FACE_INPUT_SIZE, 1];

    /// Wraps an array, rejecting anything that is not (1, 48, 48, 1) or has
    /// values outside [0, 1].
    pub fn from_array(array: Array4<f32>) -> std::result::Result<Self, FrameError> {
        if array.shape() != Self::SHAPE {
            return Err(FrameError::InvalidTensor(format!(
                "expected shape {:?}, got {:?}",
                Self::SHAPE,
                array.shape()
            )));
        }
        if let Some(v) = array.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(FrameError::InvalidTensor(format!(
                "value {v} outside [0, 1]"
            )));
        }
        Ok(Self(array))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn into_array(self) -> Array4<f32> {
        self.0
    }
}

/// Per-class scores from the classifier, index-aligned with the label map.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ClassProbabilities(Vec<f32>);

impl ClassProbabilities {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    /// Index of the highest score. Ties go to the lowest index and
    /// non-finite scores never win.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (idx, &p) in self.0.iter().enumerate() {
            if !p.is_finite() {
                continue;
            }
            match best {
                Some((_, top)) if p <= top => {}
                _ => best = Some((idx, p)),
            }
        }
        best.map(|(idx, _)| idx)
    }
}

impl From<Vec<f32>> for ClassProbabilities {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Coarse valence of a detected emotion
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    /// Fixed table: "Happy" is positive; "Sad", "Angry", "Disgust" and
    /// "Fear" are negative; every other label, known or not, is neutral.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Happy" => Sentiment::Positive,
            "Sad" | "Angry" | "Disgust" | "Fear" => Sentiment::Negative,
            _ => Sentiment::Neutral,
        }
    }
}

/// Maps an emotion label to its sentiment category.
pub fn map_to_category(label: &str) -> Sentiment {
    Sentiment::from_label(label)
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "Positive"),
            Sentiment::Negative => write!(f, "Negative"),
            Sentiment::Neutral => write!(f, "Neutral"),
        }
    }
}

/// Result of reading one face in one frame
#[derive(Clone, Debug, PartialEq)]
pub struct EmotionReading {
    /// Winning label from the label map
    pub label: String,
    /// Sentiment category of `label`
    pub sentiment: Sentiment,
    /// Full classifier output
    pub probabilities: ClassProbabilities,
    /// Face box the reading was computed from
    pub face: BoundingBox,
}

impl EmotionReading {
    /// Score of the winning label
    pub fn confidence(&self) -> f32 {
        self.probabilities
            .argmax()
            .and_then(|idx| self.probabilities.get(idx))
            .unwrap_or(0.0)
    }

    /// Text drawn next to the face, e.g. `Positive (Happy)`.
    pub fn caption(&self) -> String {
        format!("{} ({})", self.sentiment, self.label)
    }

    /// Returns the confidence as a percentage (0-100)
    pub fn confidence_percent(&self) -> u8 {
        (self.confidence().clamp(0.0, 1.0) * 100.0).round() as u8
    }
}

impl std::fmt::Display for EmotionReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}% confidence)",
            self.caption(),
            self.confidence_percent()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_length_must_match_dimensions() {
        assert_eq!(Frame::filled(4, 3, [0, 0, 0], PixelOrder::Rgb).check_well_formed(), Ok(()));
        assert_eq!(
            Frame::new(vec![0; 10], 2, 2).check_well_formed(),
            Err(FrameError::MalformedFrame(
                "10 bytes for a 2x2 frame, expected 12".to_string()
            ))
        );
    }

    #[test]
    fn sentiment_table() {
        assert_eq!(map_to_category("Happy"), Sentiment::Positive);
        assert_eq!(map_to_category("Sad"), Sentiment::Negative);
        assert_eq!(map_to_category("Angry"), Sentiment::Negative);
        assert_eq!(map_to_category("Disgust"), Sentiment::Negative);
        assert_eq!(map_to_category("Fear"), Sentiment::Negative);
        assert_eq!(map_to_category("Neutral"), Sentiment::Neutral);
        assert_eq!(map_to_category("Surprise"), Sentiment::Neutral);
        assert_eq!(map_to_category("happy"), Sentiment::Neutral);
        assert_eq!(map_to_category(""), Sentiment::Neutral);
    }

    #[test]
    fn sentiment_mapping_is_stable_across_calls() {
        let labels = ["Fear", "Happy", "Contempt", "Fear", "Happy"];
        let first: Vec<_> = labels.iter().map(|l| map_to_category(l)).collect();
        let second: Vec<_> = labels.iter().rev().map(|l| map_to_category(l)).collect();
        let second: Vec<_> = second.into_iter().rev().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(ClassProbabilities::new(vec![0.5, 0.5, 0.0]).argmax(), Some(0));
        assert_eq!(ClassProbabilities::new(vec![0.1, 0.7, 0.7]).argmax(), Some(1));
    }

    #[test]
    fn argmax_skips_nan() {
        let probs = ClassProbabilities::new(vec![f32::NAN, 0.2, 0.1]);
        assert_eq!(probs.argmax(), Some(1));
        assert_eq!(ClassProbabilities::new(vec![]).argmax(), None);
        assert_eq!(ClassProbabilities::new(vec![f32::NAN]).argmax(), None);
    }

    #[test]
    fn bounding_box_clamps_to_frame() {
        let set = LandmarkSet::new(vec![Landmark::new(-0.2, 0.1), Landmark::new(1.3, 0.6)]);
        let bbox = BoundingBox::from_landmarks(&set, 100, 50).unwrap();
        assert_eq!(
            bbox,
            BoundingBox {
                x1: 0,
                y1: 5,
                x2: 100,
                y2: 30
            }
        );
        assert_eq!(bbox.width(), 100);
        assert_eq!(bbox.height(), 25);
    }

    #[test]
    fn bounding_box_stays_ordered_when_face_is_off_frame() {
        let set = LandmarkSet::new(vec![Landmark::new(1.5, -0.5), Landmark::new(1.8, -0.1)]);
        let bbox = BoundingBox::from_landmarks(&set, 100, 100).unwrap();
        assert!(bbox.x1 <= bbox.x2 && bbox.x2 <= 100);
        assert!(bbox.y1 <= bbox.y2);
        assert!(bbox.is_smaller_than(20));
    }

    #[test]
    fn empty_landmarks_have_no_box() {
        assert!(BoundingBox::from_landmarks(&LandmarkSet::new(vec![]), 10, 10).is_none());
    }

    #[test]
    fn bgr_frame_converts_to_rgb() {
        let frame = Frame::filled(2, 1, [10, 20, 30], PixelOrder::Bgr);
        assert_eq!(&frame.data[..3], &[30, 20, 10]);
        assert_eq!(frame.rgb_at(1, 0), [10, 20, 30]);

        let rgb = frame.to_rgb();
        assert_eq!(rgb.order, PixelOrder::Rgb);
        assert_eq!(&rgb.data[..3], &[10, 20, 30]);
    }

    #[test]
    fn tensor_rejects_wrong_shape() {
        let err = FaceTensor::from_array(Array4::zeros((1, 48, 48, 3))).unwrap_err();
        assert!(matches!(err, FrameError::InvalidTensor(_)));
    }

    #[test]
    fn reading_caption_and_confidence() {
        let reading = EmotionReading {
            label: "Happy".to_string(),
            sentiment: Sentiment::Positive,
            probabilities: vec![0.7, 0.1, 0.2].into(),
            face: BoundingBox {
                x1: 0,
                y1: 0,
                x2: 30,
                y2: 30,
            },
        };
        assert_eq!(reading.caption(), "Positive (Happy)");
        assert_eq!(reading.confidence_percent(), 70);
        assert_eq!(reading.to_string(), "Positive (Happy) (70% confidence)");
    }
}
