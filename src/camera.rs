// Webcam frame source

use crate::error::{EmotionStreamError, Result};
use crate::models::Frame;
use crate::stream::FrameSource;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;
use std::time::Duration;
use tracing::{error, info};

/// Time given to the device between opening the stream and the first read.
const WARMUP: Duration = Duration::from_millis(200);

/// Pulls RGB frames from a local camera.
///
/// The stream is opened on construction and closed on drop, so a session
/// that owns one holds the device only while it runs.
pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    /// Opens the camera at `index`, falling back to the next index (some
    /// systems number built-in cameras from 1).
    pub fn open(index: u32, width: u32, height: u32, fps: u32) -> Result<Self> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(Resolution::new(width, height), FrameFormat::YUYV, fps),
        ));

        let mut camera = Self::try_open(index, requested)
            .or_else(|_| Self::try_open(index + 1, requested))
            .map_err(|e| {
                error!("Failed to open camera {} or {}: {}", index, index + 1, e);
                EmotionStreamError::CameraInit(format!(
                    "Could not open camera. Check that one is connected, not in use by another \
                     application, and that camera permissions are granted. ({e})"
                ))
            })?;

        camera.open_stream()?;
        std::thread::sleep(WARMUP);

        let res = camera.resolution();
        info!(
            "Camera '{}' streaming at {}x{}",
            camera.info().human_name(),
            res.width(),
            res.height()
        );
        Ok(Self { camera })
    }

    fn try_open(index: u32, requested: RequestedFormat) -> Result<Camera> {
        Ok(Camera::new(CameraIndex::Index(index), requested)?)
    }

    /// Names of the cameras the platform backend can see.
    pub fn list_devices() -> Result<Vec<String>> {
        let devices = nokhwa::query(ApiBackend::Auto)?;
        Ok(devices
            .iter()
            .map(|info| info.human_name().to_string())
            .collect())
    }

    pub fn resolution(&self) -> (u32, u32) {
        let res = self.camera.resolution();
        (res.width(), res.height())
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let buffer = self.camera.frame()?;
        let decoded = buffer.decode_image::<RgbFormat>().map_err(|e| {
            EmotionStreamError::SourceUnavailable(format!("Failed to decode frame: {e}"))
        })?;

        let (width, height) = (decoded.width(), decoded.height());
        Ok(Some(Frame::new(decoded.into_raw(), width, height)))
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            error!("Error stopping camera stream: {}", e);
        }
    }
}
