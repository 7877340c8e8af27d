// Still-image frame source and a display surface that writes frames to disk

use crate::error::{EmotionStreamError, Result};
use crate::models::{EmotionReading, Frame};
use crate::stream::{DisplaySurface, FrameSource};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Replays the images of a directory as frames, in file name order.
#[derive(Debug)]
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
}

impl ImageDirSource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            return Err(EmotionStreamError::SourceUnavailable(format!(
                "No png or jpeg images in {}",
                dir.display()
            )));
        }

        info!("Loaded {} frames from {}", paths.len(), dir.display());
        Ok(Self {
            paths,
            next: 0,
            looping: false,
        })
    }

    /// Starts over from the first image instead of running dry.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn load(path: &Path) -> Result<Frame> {
        let image = image::open(path)?.to_rgb8();
        let (width, height) = image.dimensions();
        Ok(Frame::new(image.into_raw(), width, height))
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.next == self.paths.len() {
            if !self.looping {
                return Ok(None);
            }
            self.next = 0;
        }

        let path = &self.paths[self.next];
        self.next += 1;
        debug!("Reading frame {}", path.display());
        Self::load(path).map(Some)
    }
}

/// Writes every rendered frame as `frame_NNNNNN.png` and logs the reading.
#[derive(Debug)]
pub struct SnapshotWriter {
    dir: PathBuf,
    written: u64,
}

impl SnapshotWriter {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, written: 0 })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn write(&self, frame: &Frame) -> Result<PathBuf> {
        let rgb = frame.to_rgb();
        let image = RgbImage::from_raw(rgb.width, rgb.height, rgb.data.clone()).ok_or_else(|| {
            EmotionStreamError::SourceUnavailable(format!(
                "{}x{} frame has a {} byte buffer",
                rgb.width,
                rgb.height,
                rgb.data.len()
            ))
        })?;
        let path = self.dir.join(format!("frame_{:06}.png", self.written));
        image.save(&path)?;
        Ok(path)
    }
}

impl DisplaySurface for SnapshotWriter {
    fn render(&mut self, frame: &Frame, reading: Option<&EmotionReading>) {
        match self.write(frame) {
            Ok(path) => {
                match reading {
                    Some(reading) => info!("{}: {}", path.display(), reading),
                    None => debug!("{}: no reading", path.display()),
                }
                self.written += 1;
            }
            Err(e) => error!("Failed to write frame: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PixelOrder;
    use tempfile::tempdir;

    fn write_png(path: &Path, rgb: [u8; 3]) {
        RgbImage::from_pixel(8, 6, image::Rgb(rgb)).save(path).unwrap();
    }

    #[test]
    fn replays_images_in_name_order() {
        let scratch = tempdir().unwrap();
        let dir = scratch.path();
        write_png(&dir.join("b.png"), [0, 0, 255]);
        write_png(&dir.join("a.png"), [255, 0, 0]);
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();

        let mut source = ImageDirSource::open(dir).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!((first.width, first.height), (8, 6));
        assert_eq!(first.rgb_at(0, 0), [255, 0, 0]);
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.rgb_at(7, 5), [0, 0, 255]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn looping_source_wraps_around() {
        let scratch = tempdir().unwrap();
        let dir = scratch.path();
        write_png(&dir.join("only.png"), [10, 20, 30]);

        let mut source = ImageDirSource::open(dir).unwrap().looping(true);
        for _ in 0..3 {
            assert!(source.next_frame().unwrap().is_some());
        }
    }

    #[test]
    fn empty_directory_is_unavailable() {
        let scratch = tempdir().unwrap();
        let dir = scratch.path();
        assert!(matches!(
            ImageDirSource::open(dir),
            Err(EmotionStreamError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn corrupt_image_breaks_the_source() {
        let scratch = tempdir().unwrap();
        let dir = scratch.path();
        std::fs::write(dir.join("broken.png"), b"not a png").unwrap();

        let mut source = ImageDirSource::open(dir).unwrap();
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn snapshots_are_written_as_rgb() {
        let scratch = tempdir().unwrap();
        let dir = scratch.path();
        let mut writer = SnapshotWriter::create(dir).unwrap();

        writer.render(&Frame::filled(4, 4, [1, 2, 3], PixelOrder::Bgr), None);
        assert_eq!(writer.written(), 1);

        let saved = image::open(dir.join("frame_000000.png")).unwrap().to_rgb8();
        assert_eq!(saved.get_pixel(0, 0).0, [1, 2, 3]);
    }
}
