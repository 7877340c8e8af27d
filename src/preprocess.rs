// Face crop preprocessing for classifier input

use crate::error::FrameError;
use crate::models::{BoundingBox, FaceTensor, Frame, FACE_INPUT_SIZE};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use ndarray::Array4;

/// Fixed resize policy: bilinear (tent) filtering, deterministic per input.
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// BT.601 luma, the weighting OpenCV uses for RGB to gray.
fn luma(rgb: [u8; 3]) -> u8 {
    let y = 0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32;
    y.round().clamp(0.0, 255.0) as u8
}

/// Crops the box out of the frame as a grayscale image.
pub fn crop_gray(frame: &Frame, bbox: &BoundingBox) -> Result<GrayImage, FrameError> {
    frame.check_well_formed()?;
    if bbox.x2 > frame.width || bbox.y2 > frame.height || bbox.width() == 0 || bbox.height() == 0
    {
        return Err(FrameError::InvalidTensor(format!(
            "face box {bbox:?} does not fit a {}x{} frame",
            frame.width, frame.height
        )));
    }

    Ok(GrayImage::from_fn(bbox.width(), bbox.height(), |x, y| {
        Luma([luma(frame.rgb_at(bbox.x1 + x, bbox.y1 + y))])
    }))
}

/// Resizes a grayscale face crop to 48x48 and scales it into a
/// (1, 48, 48, 1) tensor with values in [0, 1].
pub fn normalize_face(face: &GrayImage) -> Result<FaceTensor, FrameError> {
    let side = FACE_INPUT_SIZE as u32;
    let resized = imageops::resize(face, side, side, RESIZE_FILTER);
    let array = Array4::from_shape_fn(
        (1, FACE_INPUT_SIZE, FACE_INPUT_SIZE, 1),
        |(_, y, x, _)| resized.get_pixel(x as u32, y as u32)[0] as f32 / 255.0,
    );
    FaceTensor::from_array(array)
}

/// Crop, grayscale, resize and normalize in one step.
pub fn face_tensor(frame: &Frame, bbox: &BoundingBox) -> Result<FaceTensor, FrameError> {
    let face = crop_gray(frame, bbox)?;
    normalize_face(&face)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PixelOrder;

    fn bbox(x1: u32, y1: u32, x2: u32, y2: u32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    #[test]
    fn black_roi_gives_all_zeros() {
        let frame = Frame::filled(64, 64, [0, 0, 0], PixelOrder::Rgb);
        let tensor = face_tensor(&frame, &bbox(4, 4, 40, 36)).unwrap();
        assert_eq!(tensor.shape(), &[1, 48, 48, 1]);
        assert!(tensor.as_array().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn white_roi_gives_all_ones() {
        let frame = Frame::filled(64, 64, [255, 255, 255], PixelOrder::Bgr);
        let tensor = face_tensor(&frame, &bbox(0, 0, 64, 64)).unwrap();
        assert_eq!(tensor.shape(), &[1, 48, 48, 1]);
        assert!(tensor.as_array().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn values_stay_in_unit_range_for_noisy_input() {
        let (w, h) = (97u32, 61u32);
        let data = (0..w * h * 3).map(|i| (i * 37 % 256) as u8).collect();
        let frame = Frame::new(data, w, h);
        let tensor = face_tensor(&frame, &bbox(3, 5, 90, 60)).unwrap();
        assert_eq!(tensor.shape(), &[1, 48, 48, 1]);
        assert!(tensor.as_array().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn gray_conversion_respects_channel_order() {
        let rgb = Frame::filled(30, 30, [200, 10, 10], PixelOrder::Rgb);
        let bgr = Frame::filled(30, 30, [200, 10, 10], PixelOrder::Bgr);
        let b = bbox(0, 0, 30, 30);
        assert_eq!(crop_gray(&rgb, &b).unwrap(), crop_gray(&bgr, &b).unwrap());
        assert_eq!(crop_gray(&rgb, &b).unwrap().get_pixel(0, 0)[0], 67);
    }

    #[test]
    fn crop_outside_frame_is_rejected() {
        let frame = Frame::filled(30, 30, [0, 0, 0], PixelOrder::Rgb);
        assert!(crop_gray(&frame, &bbox(0, 0, 31, 30)).is_err());
        assert!(crop_gray(&frame, &bbox(5, 5, 5, 20)).is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        let frame = Frame::new(vec![0; 10], 30, 30);
        assert!(matches!(
            crop_gray(&frame, &bbox(0, 0, 20, 20)),
            Err(FrameError::MalformedFrame(_))
        ));
    }
}
