use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};

use crate::automation::catalog::{Catalog, ReferenceAppearance};
use crate::device::coords::{denormalize_rect, NormRect, PixelRect, ScreenSize, FULL_SCREEN};
use crate::device::screen_capture::ScreenFrame;

/// Window variance below this is treated as a flat patch.
const FLAT_VARIANCE: f64 = 1e-3;

/// Multiply-adds a direct search may spend before going coarse-to-fine.
const DIRECT_SEARCH_BUDGET: u64 = 40_000_000;

/// Smallest template side worth correlating at a reduced scale.
const MIN_COARSE_SIDE: u32 = 8;

/// One reference located in one frame. Coordinates are frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub reference: String,
    pub top_left: (u32, u32),
    pub size: (u32, u32),
    pub center: (u32, u32),
    /// Normalized correlation, clamped to [0, 1].
    pub confidence: f32,
}

impl Detection {
    /// Accepted means confident enough and, when the reference declares a
    /// region, centred inside it.
    pub fn is_accepted(&self, threshold: f32, region: Option<PixelRect>) -> bool {
        self.confidence >= threshold
            && region.map_or(true, |r| r.contains(self.center.0, self.center.1))
    }
}

/// Outcome of looking for one reference in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchVerdict {
    Accepted(Detection),
    /// Confident match, but centred outside the reference's declared region.
    RegionMismatch(Detection),
    NoDetection,
}

impl MatchVerdict {
    pub fn accepted(self) -> Option<Detection> {
        match self {
            MatchVerdict::Accepted(detection) => Some(detection),
            _ => None,
        }
    }
}

type Surface = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Zero-mean normalized correlation of `template` at every position of
/// `image`, clamped to [0, 1]. `None` when the template does not fit.
fn ncc_surface(image: &GrayImage, template: &GrayImage) -> Option<Surface> {
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > image.width() || th > image.height() {
        return None;
    }
    let cross = match_template(image, template, MatchTemplateMethod::CrossCorrelation);
    let sums = integral_image::<_, u64>(image);
    let squares = integral_squared_image::<_, u64>(image);

    let n = f64::from(tw * th);
    let t_mean = template.as_raw().iter().map(|&p| f64::from(p)).sum::<f64>() / n;
    let t_norm = template
        .as_raw()
        .iter()
        .map(|&p| (f64::from(p) - t_mean).powi(2))
        .sum::<f64>()
        .sqrt();

    let window = |table: &ImageBuffer<Luma<u64>, Vec<u64>>, x: u32, y: u32| -> f64 {
        let at = |x: u32, y: u32| table.get_pixel(x, y).0[0];
        ((at(x + tw, y + th) + at(x, y)) - (at(x + tw, y) + at(x, y + th))) as f64
    };

    Some(ImageBuffer::from_fn(cross.width(), cross.height(), |x, y| {
        let sum = window(&sums, x, y);
        let variance = (window(&squares, x, y) - sum * sum / n).max(0.0);
        let score = if t_norm <= f64::EPSILON {
            // flat reference: only a flat window of the same shade matches
            if variance < FLAT_VARIANCE {
                1.0 - (sum / n - t_mean).abs() / 255.0
            } else {
                0.0
            }
        } else if variance < FLAT_VARIANCE {
            0.0
        } else {
            (f64::from(cross.get_pixel(x, y).0[0]) - t_mean * sum) / (t_norm * variance.sqrt())
        };
        Luma([score.clamp(0.0, 1.0) as f32])
    }))
}

/// Up to `count` best positions, each suppressing its `radius` neighbourhood
/// so the next one is a different object.
fn peaks(mut surface: Surface, count: usize, radius: (u32, u32)) -> Vec<(u32, u32, f32)> {
    let (w, h) = surface.dimensions();
    let (rx, ry) = radius;
    let mut found = Vec::with_capacity(count);
    while found.len() < count {
        let best = find_extremes(&surface);
        if best.max_value < 0.0 {
            break;
        }
        let (px, py) = best.max_value_location;
        found.push((px, py, best.max_value));
        for qy in py.saturating_sub(ry)..(py + ry + 1).min(h) {
            for qx in px.saturating_sub(rx)..(px + rx + 1).min(w) {
                surface.put_pixel(qx, qy, Luma([-1.0]));
            }
        }
    }
    found
}

fn suppression_radius(tw: u32, th: u32) -> (u32, u32) {
    ((tw / 2).max(1), (th / 2).max(1))
}

/// Downscale factor for the coarse pass, if the reference survives one.
fn coarse_scale(tw: u32, th: u32) -> Option<u32> {
    [4, 2].into_iter().find(|s| tw.min(th) / s >= MIN_COARSE_SIDE)
}

/// Finds peaks on a downscaled copy, then settles each one at full
/// resolution within one coarse pixel.
fn coarse_to_fine(crop: &GrayImage, template: &GrayImage, scale: u32, count: usize) -> Vec<(u32, u32, f32)> {
    let (tw, th) = template.dimensions();
    let small_crop = imageops::resize(crop, crop.width() / scale, crop.height() / scale, FilterType::Triangle);
    let small_template = imageops::resize(template, tw / scale, th / scale, FilterType::Triangle);
    let Some(surface) = ncc_surface(&small_crop, &small_template) else {
        return Vec::new();
    };
    let coarse = peaks(surface, count * 2, suppression_radius(tw / scale, th / scale));

    let (last_x, last_y) = (crop.width() - tw, crop.height() - th);
    let mut refined: Vec<(u32, u32, f32)> = Vec::with_capacity(coarse.len());
    for (cx, cy, _) in coarse {
        let (lx, ly) = ((cx * scale).saturating_sub(scale), (cy * scale).saturating_sub(scale));
        let (hx, hy) = ((cx * scale + scale).min(last_x), (cy * scale + scale).min(last_y));
        if lx > hx || ly > hy {
            continue;
        }
        let window = imageops::crop_imm(crop, lx, ly, hx - lx + tw, hy - ly + th).to_image();
        if let Some(scores) = ncc_surface(&window, template) {
            let best = find_extremes(&scores);
            let (bx, by) = best.max_value_location;
            refined.push((lx + bx, ly + by, best.max_value));
        }
    }

    refined.sort_by(|a, b| b.2.total_cmp(&a.2));
    let (rx, ry) = suppression_radius(tw, th);
    let mut kept: Vec<(u32, u32, f32)> = Vec::with_capacity(count);
    for candidate in refined {
        if kept.len() == count {
            break;
        }
        if kept
            .iter()
            .all(|&(x, y, _)| x.abs_diff(candidate.0) > rx || y.abs_diff(candidate.1) > ry)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// Top-left positions whose template centre lands inside `region`.
fn search_bounds(
    frame: ScreenSize,
    region: PixelRect,
    tw: u32,
    th: u32,
) -> Option<((u32, u32), (u32, u32))> {
    if region.is_empty() || tw > frame.width || th > frame.height {
        return None;
    }
    let axis = |start: u32, end: u32, t: u32, limit: u32| -> Option<(u32, u32)> {
        let lo = start.saturating_sub(t / 2);
        let hi = (end - 1).checked_sub(t / 2)?.min(limit - t);
        (lo <= hi).then_some((lo, hi))
    };
    let xs = axis(region.left, region.right(), tw, frame.width)?;
    let ys = axis(region.top, region.bottom(), th, frame.height)?;
    Some((xs, ys))
}

/// Single-template, translation-only matcher over a fixed catalog.
#[derive(Debug, Clone)]
pub struct Matcher {
    catalog: Catalog,
    candidates_per_reference: usize,
}

impl Matcher {
    pub fn new(catalog: Catalog, candidates_per_reference: usize) -> Self {
        Self {
            catalog,
            candidates_per_reference: candidates_per_reference.max(1),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Declared region of `name` in pixels of a frame of `size`.
    pub fn region_of(&self, name: &str, size: ScreenSize) -> Option<PixelRect> {
        let region = self.catalog.get(name)?.region()?;
        denormalize_rect(size, region)
    }

    /// Ranked candidates for every requested reference, best first.
    ///
    /// The search covers `roi` when given, otherwise the reference's declared
    /// region, otherwise the whole frame. Only positions whose centre falls
    /// inside that area are considered. Equal confidences keep request order.
    /// Unknown names are skipped.
    pub fn find(&self, frame: &ScreenFrame, names: &[&str], roi: Option<NormRect>) -> Vec<Detection> {
        let mut detections = Vec::new();
        for name in names {
            let Some(reference) = self.catalog.get(name) else {
                log::debug!("Reference '{}' not in catalog, skipping", name);
                continue;
            };
            let area = roi.or(reference.region()).unwrap_or(FULL_SCREEN);
            detections.extend(self.search(frame, reference, area));
        }
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        detections
    }

    /// Best accepted detection of `name`, or `None`.
    pub fn accept(&self, frame: &ScreenFrame, name: &str, threshold: f32) -> Option<Detection> {
        let region = self.region_of(name, frame.size());
        self.find(frame, &[name], None)
            .into_iter()
            .find(|d| d.is_accepted(threshold, region))
    }

    /// Like [`Self::accept`], but when nothing is accepted inside a declared
    /// region, searches the whole frame to tell a misplaced match from absence.
    pub fn verdict(&self, frame: &ScreenFrame, name: &str, threshold: f32) -> MatchVerdict {
        if let Some(detection) = self.accept(frame, name, threshold) {
            return MatchVerdict::Accepted(detection);
        }
        if self.region_of(name, frame.size()).is_none() {
            return MatchVerdict::NoDetection;
        }
        match self
            .find(frame, &[name], Some(FULL_SCREEN))
            .into_iter()
            .find(|d| d.confidence >= threshold)
        {
            Some(outside) => MatchVerdict::RegionMismatch(outside),
            None => MatchVerdict::NoDetection,
        }
    }

    fn search(&self, frame: &ScreenFrame, reference: &ReferenceAppearance, area: NormRect) -> Vec<Detection> {
        let size = frame.size();
        let (tw, th) = (reference.width(), reference.height());
        let Some(region) = denormalize_rect(size, area) else {
            return Vec::new();
        };
        let Some(((x0, x1), (y0, y1))) = search_bounds(size, region, tw, th) else {
            return Vec::new();
        };

        let crop = imageops::crop_imm(frame.pixels(), x0, y0, x1 - x0 + tw, y1 - y0 + th).to_image();
        let count = self.candidates_per_reference;
        let work = u64::from(x1 - x0 + 1) * u64::from(y1 - y0 + 1) * u64::from(tw * th);
        let found = match coarse_scale(tw, th) {
            Some(scale) if work > DIRECT_SEARCH_BUDGET => coarse_to_fine(&crop, reference.pixels(), scale, count),
            _ => ncc_surface(&crop, reference.pixels())
                .map(|surface| peaks(surface, count, suppression_radius(tw, th)))
                .unwrap_or_default(),
        };

        found
            .into_iter()
            .map(|(x, y, confidence)| {
                let (x, y) = (x0 + x, y0 + y);
                Detection {
                    reference: reference.name().to_string(),
                    top_left: (x, y),
                    size: (tw, th),
                    center: (x + tw / 2, y + th / 2),
                    confidence,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::catalog::ReferenceAppearance;
    use crate::test_support::{blank, blocks, degrade, frame_of, paste, pattern};

    const THIRD: f32 = 1.0 / 3.0;

    fn catalog_with(refs: Vec<ReferenceAppearance>) -> Matcher {
        Matcher::new(Catalog::new(refs), 3)
    }

    #[test]
    fn exact_copy_scores_one_at_its_position() {
        let tpl = pattern(12, 10, 7);
        let mut screen = blank(96, 54);
        paste(&mut screen, &tpl, 30, 20);
        let matcher = catalog_with(vec![ReferenceAppearance::new("button", tpl).unwrap()]);
        let found = matcher.find(&frame_of(screen), &["button"], None);
        assert_eq!(found[0].top_left, (30, 20));
        assert_eq!(found[0].center, (36, 25));
        assert!(found[0].confidence > 0.999);
    }

    #[test]
    fn results_are_sorted_and_bounded() {
        let a = pattern(10, 10, 1);
        let b = pattern(8, 8, 2);
        let mut screen = blank(80, 60);
        paste(&mut screen, &degrade(&a, 3), 5, 5);
        paste(&mut screen, &b, 50, 30);
        let matcher = catalog_with(vec![
            ReferenceAppearance::new("a", a).unwrap(),
            ReferenceAppearance::new("b", b).unwrap(),
        ]);
        let found = matcher.find(&frame_of(screen), &["a", "b"], None);
        assert!(!found.is_empty());
        assert!(found.windows(2).all(|w| w[0].confidence >= w[1].confidence));
        assert!(found.iter().all(|d| (0.0..=1.0).contains(&d.confidence)));
        assert_eq!(found[0].reference, "b");
    }

    #[test]
    fn matching_twice_is_identical() {
        let tpl = pattern(9, 9, 4);
        let mut screen = pattern(70, 40, 99);
        paste(&mut screen, &tpl, 40, 12);
        let frame = frame_of(screen);
        let matcher = catalog_with(vec![ReferenceAppearance::new("x", tpl).unwrap()]);
        assert_eq!(
            matcher.find(&frame, &["x"], None),
            matcher.find(&frame, &["x"], None)
        );
    }

    #[test]
    fn absent_reference_and_unknown_names_yield_no_acceptance() {
        let tpl = pattern(10, 10, 5);
        let matcher = catalog_with(vec![ReferenceAppearance::new("x", tpl).unwrap()]);
        let frame = frame_of(blank(60, 40));
        assert!(matcher.accept(&frame, "x", 0.85).is_none());
        assert!(matcher.find(&frame, &["nope"], None).is_empty());
        assert_eq!(matcher.verdict(&frame, "nope", 0.85), MatchVerdict::NoDetection);
    }

    #[test]
    fn template_larger_than_frame_is_not_an_error() {
        let matcher = catalog_with(vec![ReferenceAppearance::new("big", pattern(50, 50, 3)).unwrap()]);
        assert!(matcher.find(&frame_of(blank(40, 40)), &["big"], None).is_empty());
    }

    // The misdirected-click regression: a neighbouring card that looks the
    // same scores higher than the real one, outside the declared region.
    #[test]
    fn declared_region_beats_global_best() {
        let card = blocks(16, 16, 4, 11);
        let mut screen = blank(960, 540);
        paste(&mut screen, &card, 500 - 8, 300);
        paste(&mut screen, &degrade(&card, 5), 700 - 8, 300);
        let frame = frame_of(screen);
        let matcher = catalog_with(vec![ReferenceAppearance::new("orbis", card)
            .unwrap()
            .with_region((2.0 * THIRD, 0.0, THIRD, 1.0))]);

        let global = matcher.find(&frame, &["orbis"], Some(FULL_SCREEN));
        assert_eq!(global[0].center.0, 500);
        assert_eq!(global[1].center.0, 700);
        assert!(global[0].confidence > global[1].confidence);

        let constrained = matcher.find(&frame, &["orbis"], None);
        assert!(constrained.iter().all(|d| d.center.0 >= 640));
        let accepted = matcher.accept(&frame, "orbis", 0.8).unwrap();
        assert_eq!(accepted.center.0, 700);
    }

    #[test]
    fn match_only_outside_region_is_a_region_mismatch() {
        let card = pattern(16, 16, 12);
        let mut screen = blank(240, 135);
        paste(&mut screen, &card, 40, 60);
        let frame = frame_of(screen);
        let matcher = catalog_with(vec![ReferenceAppearance::new("orbis", card)
            .unwrap()
            .with_region((2.0 * THIRD, 0.0, THIRD, 1.0))]);
        assert!(matcher.accept(&frame, "orbis", 0.85).is_none());
        match matcher.verdict(&frame, "orbis", 0.85) {
            MatchVerdict::RegionMismatch(d) => assert_eq!(d.center, (48, 68)),
            other => panic!("expected region mismatch, got {:?}", other),
        }
    }

    #[test]
    fn explicit_roi_overrides_declared_region_but_not_acceptance() {
        let card = pattern(16, 16, 13);
        let mut screen = blank(240, 135);
        paste(&mut screen, &card, 40, 60);
        let frame = frame_of(screen);
        let matcher = catalog_with(vec![ReferenceAppearance::new("card", card)
            .unwrap()
            .with_region((2.0 * THIRD, 0.0, THIRD, 1.0))]);
        let found = matcher.find(&frame, &["card"], Some((0.0, 0.0, 0.5, 1.0)));
        assert_eq!(found[0].top_left, (40, 60));
        let region = matcher.region_of("card", frame.size());
        assert!(!found[0].is_accepted(0.85, region));
    }

    #[test]
    fn flat_reference_matches_only_its_own_shade() {
        let flat = GrayImage::from_pixel(6, 6, Luma([200]));
        let mut screen = pattern(60, 40, 21);
        paste(&mut screen, &flat, 10, 10);
        paste(&mut screen, &GrayImage::from_pixel(6, 6, Luma([40])), 40, 20);
        let matcher = catalog_with(vec![ReferenceAppearance::new("flat", flat).unwrap()]);
        let found = matcher.find(&frame_of(screen), &["flat"], None);
        assert_eq!(found[0].top_left, (10, 10));
        assert!(found[0].confidence > 0.999);
        let dark = found.iter().find(|d| d.top_left == (40, 20)).map_or(0.0, |d| d.confidence);
        assert!(dark < 0.5);
    }

    #[test]
    fn large_reference_on_full_frame_lands_on_the_exact_pixel() {
        assert_eq!(coarse_scale(120, 40), Some(4));
        let button = blocks(120, 40, 8, 31);
        let mut screen = blank(960, 540);
        paste(&mut screen, &button, 403, 301);
        let matcher = catalog_with(vec![ReferenceAppearance::new("button", button).unwrap()]);
        let found = matcher.find(&frame_of(screen), &["button"], None);
        assert_eq!(found[0].top_left, (403, 301));
        assert!(found[0].confidence > 0.999);
        assert!(found.len() <= 3);
    }

    #[test]
    fn small_references_skip_the_coarse_pass() {
        assert_eq!(coarse_scale(16, 16), Some(2));
        assert_eq!(coarse_scale(12, 40), None);
    }

    #[test]
    fn search_bounds_keep_centres_inside_region() {
        let frame = ScreenSize::new(100, 50);
        let region = PixelRect { left: 60, top: 0, width: 40, height: 50 };
        let ((x0, x1), (y0, y1)) = search_bounds(frame, region, 10, 10).unwrap();
        assert_eq!((x0, x1), (55, 90));
        assert_eq!((y0, y1), (0, 40));
        assert!(search_bounds(frame, PixelRect { left: 0, top: 0, width: 0, height: 5 }, 4, 4).is_none());
    }
}
