use std::path::Path;
use std::time::Instant;

use image::{DynamicImage, GrayImage};

use crate::device::adb::AdbController;
use crate::device::coords::ScreenSize;
use crate::error::CaptureError;

/// One captured screen, reduced to luminance. Owned by the tick that took it.
#[derive(Debug, Clone)]
pub struct ScreenFrame {
    pixels: GrayImage,
    captured_at: Instant,
}

impl ScreenFrame {
    pub fn new(pixels: GrayImage, captured_at: Instant) -> Self {
        Self { pixels, captured_at }
    }

    pub fn from_image(image: &DynamicImage, captured_at: Instant) -> Self {
        Self::new(image.to_luma8(), captured_at)
    }

    pub fn size(&self) -> ScreenSize {
        ScreenSize::new(self.pixels.width(), self.pixels.height())
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn save(&self, path: &Path) -> Result<(), image::ImageError> {
        self.pixels.save(path)
    }
}

/// Anything that can hand the controller a fresh frame.
pub trait ScreenSource {
    fn capture_frame(&mut self) -> Result<ScreenFrame, CaptureError>;
}

/// Screenshots over `adb exec-out screencap`.
pub struct AdbScreenCapture {
    adb: AdbController,
    expected: ScreenSize,
}

impl AdbScreenCapture {
    pub fn new(adb: AdbController, expected: ScreenSize) -> Self {
        Self { adb, expected }
    }

    fn grab(&self) -> Result<ScreenFrame, CaptureError> {
        let png = self.adb.screencap()?;
        let captured_at = Instant::now();
        let image = image::load_from_memory(&png).map_err(|e| CaptureError::Decode(e.to_string()))?;
        let frame = ScreenFrame::from_image(&image, captured_at);
        check_resolution(self.expected, frame.size())?;
        Ok(frame)
    }
}

impl ScreenSource for AdbScreenCapture {
    fn capture_frame(&mut self) -> Result<ScreenFrame, CaptureError> {
        match self.grab() {
            Ok(frame) => Ok(frame),
            Err(err) if err.is_connection_loss() => {
                log::warn!("Screenshot failed ({}), reconnecting once", err);
                self.adb
                    .connect()
                    .map_err(|e| CaptureError::Unreachable(e.to_string()))?;
                self.grab()
            }
            Err(err) => Err(err),
        }
    }
}

/// The core never rescales; a device at another resolution is an error.
fn check_resolution(expected: ScreenSize, actual: ScreenSize) -> Result<(), CaptureError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CaptureError::Resolution {
            expected_width: expected.width,
            expected_height: expected.height,
            actual_width: actual.width,
            actual_height: actual.height,
        })
    }
}
