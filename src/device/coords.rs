/// A point in screen-normalized coordinates, each axis in [0, 1].
pub type NormPoint = (f32, f32);
/// A rectangle in screen-normalized coordinates: (x, y, width, height).
pub type NormRect = (f32, f32, f32, f32);

/// The whole screen as a normalized rectangle.
pub const FULL_SCREEN: NormRect = (0.0, 0.0, 1.0, 1.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Pixel rectangle (left, top, width, height) inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }

    /// Half-open containment: the right and bottom edges are outside.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right() && y >= self.top && y < self.bottom()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

fn clamp01(value: f32) -> f32 {
    if value < 0.0 {
        0.0
    } else if value > 1.0 {
        1.0
    } else {
        value
    }
}

pub fn is_normalized(value: f32) -> bool {
    (0.0..=1.0).contains(&value)
}

pub fn normalize_point(size: ScreenSize, x: u32, y: u32) -> Option<NormPoint> {
    if size.width == 0 || size.height == 0 {
        return None;
    }
    let nx = clamp01(x as f32 / size.width as f32);
    let ny = clamp01(y as f32 / size.height as f32);
    Some((nx, ny))
}

pub fn denormalize_point(size: ScreenSize, point: NormPoint) -> Option<(u32, u32)> {
    if size.width == 0 || size.height == 0 {
        return None;
    }
    let max_x = (size.width - 1) as f32;
    let max_y = (size.height - 1) as f32;
    let px = (clamp01(point.0) * max_x).round() as u32;
    let py = (clamp01(point.1) * max_y).round() as u32;
    Some((px, py))
}

pub fn denormalize_rect(size: ScreenSize, rect: NormRect) -> Option<PixelRect> {
    if size.width == 0 || size.height == 0 {
        return None;
    }
    let (x, y, width, height) = rect;
    let left = (clamp01(x) * size.width as f32).round() as u32;
    let top = (clamp01(y) * size.height as f32).round() as u32;
    let mut w = (clamp01(width) * size.width as f32).round() as u32;
    let mut h = (clamp01(height) * size.height as f32).round() as u32;
    if left + w > size.width {
        w = size.width.saturating_sub(left);
    }
    if top + h > size.height {
        h = size.height.saturating_sub(top);
    }
    Some(PixelRect {
        left,
        top,
        width: w,
        height: h,
    })
}
