// Landmark mesh and caption drawing

use crate::error::{EmotionStreamError, Result};
use crate::models::{BoundingBox, EmotionReading, Frame, LandmarkSet, PixelOrder};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::warn;

/// Colors and caption placement. Colors are RGB; they are swapped when the
/// frame stores BGR.
#[derive(Clone)]
pub struct OverlayStyle {
    pub mesh_color: [u8; 3],
    pub caption_color: [u8; 3],
    /// Caption baseline sits this many pixels above the face box.
    pub caption_offset: i32,
    /// Pixel height of caption glyphs when a font is loaded.
    pub caption_scale: f32,
    /// Block size of the built-in bitmap glyphs when no font is loaded.
    pub bitmap_scale: i32,
    pub font: Option<FontArc>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            mesh_color: [0, 255, 0],
            caption_color: [255, 0, 0],
            caption_offset: 10,
            caption_scale: 24.0,
            bitmap_scale: 2,
            font: None,
        }
    }
}

/// What was written next to the face.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub caption: String,
    /// Left end of the caption baseline, in frame pixels.
    pub anchor: (i32, i32),
}

/// Draws landmark meshes and emotion captions onto frames.
#[derive(Clone, Default)]
pub struct Annotator {
    style: OverlayStyle,
}

impl Annotator {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    /// Loads a TrueType/OpenType font for captions.
    pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontArc> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        FontArc::try_from_vec(bytes).map_err(|e| {
            EmotionStreamError::Config(format!("invalid caption font {}: {e}", path.display()))
        })
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    /// Caption baseline anchor for a face box: its top-left corner, raised
    /// by the caption offset.
    pub fn caption_anchor(&self, face: &BoundingBox) -> (i32, i32) {
        (face.x1 as i32, face.y1 as i32 - self.style.caption_offset)
    }

    /// Draws the mesh and the caption for `reading` in place.
    pub fn annotate(
        &self,
        frame: &mut Frame,
        landmarks: &LandmarkSet,
        reading: &EmotionReading,
    ) -> Annotation {
        let annotation = Annotation {
            caption: reading.caption(),
            anchor: self.caption_anchor(&reading.face),
        };

        let (width, height, order) = (frame.width, frame.height, frame.order);
        let Some(mut canvas) = RgbImage::from_raw(width, height, std::mem::take(&mut frame.data))
        else {
            warn!("Skipping overlay: frame buffer does not match {width}x{height}");
            return annotation;
        };

        self.draw_mesh(&mut canvas, landmarks, order);
        self.draw_caption(&mut canvas, &annotation, order);

        frame.data = canvas.into_raw();
        annotation
    }

    fn draw_mesh(&self, canvas: &mut RgbImage, landmarks: &LandmarkSet, order: PixelOrder) {
        let color = stored(self.style.mesh_color, order);
        let points = landmarks.to_pixels(canvas.width(), canvas.height());

        if landmarks.connections.is_empty() {
            for &point in &points {
                draw_filled_circle_mut(canvas, point, 1, color);
            }
            return;
        }

        for &(a, b) in landmarks.connections {
            let (Some(&start), Some(&end)) = (points.get(a), points.get(b)) else {
                continue;
            };
            draw_line_segment_mut(
                canvas,
                (start.0 as f32, start.1 as f32),
                (end.0 as f32, end.1 as f32),
                color,
            );
        }
    }

    fn draw_caption(&self, canvas: &mut RgbImage, annotation: &Annotation, order: PixelOrder) {
        let color = stored(self.style.caption_color, order);
        let (x, baseline) = annotation.anchor;

        match &self.style.font {
            Some(font) => {
                let scale = PxScale::from(self.style.caption_scale);
                let (_, text_height) = text_size(scale, font, &annotation.caption);
                let top = baseline - text_height as i32;
                draw_text_mut(canvas, color, x, top, scale, font, &annotation.caption);
            }
            None => draw_bitmap_text(
                canvas,
                x,
                baseline,
                &annotation.caption,
                self.style.bitmap_scale.max(1),
                color,
            ),
        }
    }
}

fn stored(rgb: [u8; 3], order: PixelOrder) -> Rgb<u8> {
    match order {
        PixelOrder::Rgb => Rgb(rgb),
        PixelOrder::Bgr => Rgb([rgb[2], rgb[1], rgb[0]]),
    }
}

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;

/// Upper-cased 5x7 block text whose last row sits just above `baseline`.
fn draw_bitmap_text(
    canvas: &mut RgbImage,
    x: i32,
    baseline: i32,
    text: &str,
    scale: i32,
    color: Rgb<u8>,
) {
    let top = baseline - GLYPH_HEIGHT * scale;
    let mut cursor = x;
    for ch in text.chars() {
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                    let rect = Rect::at(cursor + col * scale, top + row as i32 * scale)
                        .of_size(scale as u32, scale as u32);
                    draw_filled_rect_mut(canvas, rect, color);
                }
            }
        }
        cursor += (GLYPH_WIDTH + 1) * scale;
    }
}

fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '%' => [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011],
        ' ' => [0; 7],
        _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0, 0b00100],
    }
}
