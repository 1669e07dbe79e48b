//! Synthetic screens and fake collaborators for unit tests.

use std::collections::VecDeque;
use std::time::Instant;

use image::{GrayImage, Luma};

use crate::device::input::{DeviceKey, TouchInput};
use crate::device::screen_capture::{ScreenFrame, ScreenSource};
use crate::error::{CaptureError, DispatchError};

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Deterministic noise texture; different seeds are uncorrelated.
pub fn pattern(width: u32, height: u32, seed: u64) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let h = mix(seed.wrapping_mul(0x1_0000_0001) ^ ((y as u64) << 32 | x as u64));
        Luma([(h & 0xFF) as u8])
    })
}

/// Noise made of `cell`-sized flat squares; survives downscaling.
pub fn blocks(width: u32, height: u32, cell: u32, seed: u64) -> GrayImage {
    let grid = pattern(width.div_ceil(cell), height.div_ceil(cell), seed);
    GrayImage::from_fn(width, height, |x, y| *grid.get_pixel(x / cell, y / cell))
}

/// Copy of `img` with bounded noise added, so it correlates strongly but not perfectly.
pub fn degrade(img: &GrayImage, seed: u64) -> GrayImage {
    let noise = pattern(img.width(), img.height(), seed ^ 0xDEAD_BEEF);
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let offset = noise.get_pixel(x, y).0[0] as i32 / 4 - 32;
        Luma([(img.get_pixel(x, y).0[0] as i32 + offset).clamp(0, 255) as u8])
    })
}

pub fn blank(width: u32, height: u32) -> GrayImage {
    GrayImage::new(width, height)
}

pub fn paste(target: &mut GrayImage, src: &GrayImage, left: u32, top: u32) {
    for (x, y, px) in src.enumerate_pixels() {
        if left + x < target.width() && top + y < target.height() {
            target.put_pixel(left + x, top + y, *px);
        }
    }
}

pub fn frame_of(img: GrayImage) -> ScreenFrame {
    ScreenFrame::new(img, Instant::now())
}

/// Plays back frames in order, then repeats `idle` forever.
pub struct ScriptedScreen {
    frames: VecDeque<GrayImage>,
    idle: GrayImage,
    failures: usize,
    pub captures: usize,
}

impl ScriptedScreen {
    pub fn new(frames: Vec<GrayImage>, idle: GrayImage) -> Self {
        Self {
            frames: frames.into(),
            idle,
            failures: 0,
            captures: 0,
        }
    }

    /// The next `n` captures fail as if the device dropped out.
    pub fn fail_next(&mut self, n: usize) {
        self.failures = n;
    }
}

impl ScreenSource for ScriptedScreen {
    fn capture_frame(&mut self) -> Result<ScreenFrame, CaptureError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(CaptureError::Unreachable("scripted outage".to_string()));
        }
        self.captures += 1;
        let img = self.frames.pop_front().unwrap_or_else(|| self.idle.clone());
        Ok(frame_of(img))
    }
}

#[derive(Default)]
pub struct RecordingInput {
    pub taps: Vec<(u32, u32)>,
    pub keys: Vec<DeviceKey>,
    pub stopped: Vec<String>,
    fail: bool,
}

impl RecordingInput {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl TouchInput for RecordingInput {
    fn tap(&mut self, x: u32, y: u32) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError::Unreachable("scripted outage".to_string()));
        }
        self.taps.push((x, y));
        Ok(())
    }

    fn press_key(&mut self, key: DeviceKey) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError::Unreachable("scripted outage".to_string()));
        }
        self.keys.push(key);
        Ok(())
    }

    fn force_stop(&mut self, package: &str) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError::Unreachable("scripted outage".to_string()));
        }
        self.stopped.push(package.to_string());
        Ok(())
    }
}
