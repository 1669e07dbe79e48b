use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::automation::detection::Detection;
use crate::device::coords::{denormalize_point, NormPoint, ScreenSize};
use crate::device::input::TouchInput;
use crate::error::DispatchError;

/// Relative spread applied to timer intervals.
const INTERVAL_JITTER: f64 = 0.2;

/// Turns detections and fixed positions into single taps on the device.
#[derive(Debug)]
pub struct ActionTranslator {
    jitter_px: u32,
    screen: ScreenSize,
    rng: StdRng,
}

impl ActionTranslator {
    pub fn new(jitter_px: u32, screen: ScreenSize) -> Self {
        Self {
            jitter_px,
            screen,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic jitter, for tests and replays.
    pub fn with_seed(jitter_px: u32, screen: ScreenSize, seed: u64) -> Self {
        Self {
            jitter_px,
            screen,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Taps once near the detection's centre. Returns the coordinates sent.
    pub fn act_upon<I: TouchInput + ?Sized>(
        &mut self,
        input: &mut I,
        detection: &Detection,
    ) -> Result<(u32, u32), DispatchError> {
        log::info!(
            "Tapping '{}' at {:?} ({:.2})",
            detection.reference,
            detection.center,
            detection.confidence
        );
        self.tap_at(input, detection.center.0, detection.center.1)
    }

    /// Taps once near a fixed normalized position.
    pub fn tap_normalized<I: TouchInput + ?Sized>(
        &mut self,
        input: &mut I,
        position: NormPoint,
    ) -> Result<(u32, u32), DispatchError> {
        let (x, y) = denormalize_point(self.screen, position)
            .ok_or_else(|| DispatchError::Rejected(format!("no screen for position {:?}", position)))?;
        self.tap_at(input, x, y)
    }

    pub fn tap_at<I: TouchInput + ?Sized>(
        &mut self,
        input: &mut I,
        x: u32,
        y: u32,
    ) -> Result<(u32, u32), DispatchError> {
        let target = self.jitter(x, y);
        input.tap(target.0, target.1)?;
        Ok(target)
    }

    /// `base` spread by ±20%.
    pub fn jittered_interval(&mut self, base: Duration) -> Duration {
        let factor = self.rng.gen_range(1.0 - INTERVAL_JITTER..=1.0 + INTERVAL_JITTER);
        base.mul_f64(factor)
    }

    fn jitter(&mut self, x: u32, y: u32) -> (u32, u32) {
        let j = self.jitter_px as i64;
        let (dx, dy) = if j > 0 {
            (self.rng.gen_range(-j..=j), self.rng.gen_range(-j..=j))
        } else {
            (0, 0)
        };
        let max_x = self.screen.width.saturating_sub(1) as i64;
        let max_y = self.screen.height.saturating_sub(1) as i64;
        (
            (x as i64 + dx).clamp(0, max_x) as u32,
            (y as i64 + dy).clamp(0, max_y) as u32,
        )
    }
}
