//! Resolution levels and the mapping from display parameters to a decode request.
//!
//! [`select_resolution`] is the pure function at the heart of the request
//! logic: given how many device pixels the visible region occupies, it picks the
//! cheapest resolution level that still delivers at least that many pixels and
//! converts the physical region into a pixel rectangle inside that level.

use crate::metadata::{FrameMetadata, Region, Vec2};
use crate::{Result, StreamError};
use smallvec::SmallVec;

/// Slack for floating point noise when comparing a level against a footprint.
const FOOTPRINT_EPSILON: f64 = 1e-6;

/// One discrete decode tier offered by a source for a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionLevel {
    /// Position in the owning [`ResolutionSet`], 0 = coarsest.
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Fraction of the full resolution this level represents (1.0 = full).
    pub zoom_percent: f64,
}

impl ResolutionLevel {
    pub fn full_image(&self) -> SubImage {
        SubImage::new(0, 0, self.width, self.height)
    }
}

/// Ordered list of levels, coarsest first, strictly increasing in both dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionSet {
    levels: SmallVec<[ResolutionLevel; 8]>,
}

impl ResolutionSet {
    /// Builds a set from `(width, height)` bounds listed coarsest to finest.
    pub fn new(bounds: &[(u32, u32)]) -> Result<Self> {
        let Some(&(full_width, _)) = bounds.last() else {
            return Err(StreamError::Metadata("resolution set is empty".into()));
        };

        for pair in bounds.windows(2) {
            let ((w0, h0), (w1, h1)) = (pair[0], pair[1]);
            if w1 <= w0 || h1 <= h0 {
                return Err(StreamError::Metadata(format!(
                    "resolution levels not increasing: {}x{} then {}x{}",
                    w0, h0, w1, h1
                )));
            }
        }
        if bounds.iter().any(|&(w, h)| w == 0 || h == 0) {
            return Err(StreamError::Metadata("resolution level with zero size".into()));
        }

        let levels = bounds
            .iter()
            .enumerate()
            .map(|(index, &(width, height))| ResolutionLevel {
                index,
                width,
                height,
                zoom_percent: width as f64 / full_width as f64,
            })
            .collect();
        Ok(Self { levels })
    }

    /// Wavelet-style pyramid: each coarser level halves the previous one
    /// (rounding up), at most `count` levels, stopping before a dimension
    /// would stop shrinking.
    pub fn dyadic(full_width: u32, full_height: u32, count: usize) -> Result<Self> {
        let mut bounds: Vec<(u32, u32)> = Vec::with_capacity(count.max(1));
        let (mut w, mut h) = (full_width, full_height);
        bounds.push((w, h));
        while bounds.len() < count {
            let next = (w.div_ceil(2), h.div_ceil(2));
            if next.0 >= w || next.1 >= h {
                break;
            }
            (w, h) = next;
            bounds.push((w, h));
        }
        bounds.reverse();
        Self::new(&bounds)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, index: usize) -> Option<&ResolutionLevel> {
        self.levels.get(index)
    }

    pub fn finest(&self) -> &ResolutionLevel {
        // Non-empty by construction.
        &self.levels[self.levels.len() - 1]
    }

    pub fn coarsest(&self) -> &ResolutionLevel {
        &self.levels[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolutionLevel> {
        self.levels.iter()
    }

    /// Coarsest level whose bounds cover `width`×`height`; the finest level when
    /// none does.
    pub fn next_level(&self, width: f64, height: f64) -> &ResolutionLevel {
        self.levels
            .iter()
            .find(|level| {
                level.width as f64 + FOOTPRINT_EPSILON >= width
                    && level.height as f64 + FOOTPRINT_EPSILON >= height
            })
            .unwrap_or_else(|| self.finest())
    }
}

/// Pixel rectangle inside a resolution level, origin at the top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubImage {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SubImage {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, other: &SubImage) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// What to decode: one sub-image of one frame at one level.
///
/// Equality on all fields is what lets the view skip redundant decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubImageRequest {
    pub frame: usize,
    pub level: usize,
    pub sub_image: SubImage,
}

/// Whole-frame pixel footprint the region needs on screen: how large a level
/// must be so that the visible region gets at least one image pixel per device
/// pixel.
pub fn target_footprint(
    viewport_height: u32,
    camera_width: f64,
    meta: &FrameMetadata,
    region: &Region,
) -> (f64, f64) {
    let camera_width = if camera_width > 0.0 {
        camera_width
    } else {
        region.height()
    };
    let ratio = viewport_height as f64 / camera_width;
    let screen_width = region.width() * ratio;
    let screen_height = region.height() * ratio;

    (
        screen_width * meta.region.width() / region.width(),
        screen_height * meta.region.height() / region.height(),
    )
}

/// Maps viewport, camera field and physical region to the sub-image request
/// that should be decoded for `meta`.
pub fn select_resolution(
    viewport_height: u32,
    camera_width: f64,
    meta: &FrameMetadata,
    levels: &ResolutionSet,
    region: &Region,
) -> SubImageRequest {
    let (footprint_w, footprint_h) = target_footprint(viewport_height, camera_width, meta, region);
    let level = levels.next_level(footprint_w, footprint_h);

    let level_w = level.width as f64;
    let level_h = level.height as f64;
    let units_per_px_x = meta.region.width() / level_w;
    let units_per_px_y = meta.region.height() / level_h;

    let width = (region.width() / units_per_px_x).round() as i64;
    let height = (region.height() / units_per_px_y).round() as i64;

    let region_ul = region.upper_left();
    let frame_ul = meta.region.upper_left();
    let x = ((region_ul.x - frame_ul.x) / meta.region.width() * level_w).round() as i64;
    let y = ((frame_ul.y - region_ul.y) / meta.region.height() * level_h).round() as i64;

    let (x, width) = clamp_span(x, width, level.width);
    let (y, height) = clamp_span(y, height, level.height);

    SubImageRequest {
        frame: meta.index,
        level: level.index,
        sub_image: SubImage::new(x, y, width, height),
    }
}

/// Intersects `[start, start + len)` with `[0, bound)`, keeping at least one pixel.
fn clamp_span(start: i64, len: i64, bound: u32) -> (u32, u32) {
    let bound = bound as i64;
    let lo = start.clamp(0, bound - 1);
    let hi = (start + len).clamp(lo + 1, bound);
    (lo as u32, (hi - lo) as u32)
}

/// Physical region covered by `sub_image` at `level` of the frame: the
/// placement handed to the display sink together with the tile.
pub fn tile_region(meta: &FrameMetadata, level: &ResolutionLevel, sub_image: &SubImage) -> Region {
    let units_per_px_x = meta.region.width() / level.width as f64;
    let units_per_px_y = meta.region.height() / level.height as f64;
    let frame_ul = meta.region.upper_left();

    let left = frame_ul.x + sub_image.x as f64 * units_per_px_x;
    let top = frame_ul.y - sub_image.y as f64 * units_per_px_y;
    let width = sub_image.width as f64 * units_per_px_x;
    let height = sub_image.height as f64 * units_per_px_y;

    Region::new(Vec2::new(left, top - height), Vec2::new(width, height))
}
