//! Frame metadata and the immutable geometry values passed around the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A physical 2D point (solar radii or meters, depending on the series).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned physical rectangle, anchored at its lower-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub lower_left: Vec2,
    pub size: Vec2,
}

impl Region {
    pub const fn new(lower_left: Vec2, size: Vec2) -> Self {
        Self { lower_left, size }
    }

    pub fn width(&self) -> f64 {
        self.size.x
    }

    pub fn height(&self) -> f64 {
        self.size.y
    }

    pub fn upper_left(&self) -> Vec2 {
        Vec2::new(self.lower_left.x, self.lower_left.y + self.size.y)
    }

    pub fn upper_right(&self) -> Vec2 {
        Vec2::new(self.lower_left.x + self.size.x, self.lower_left.y + self.size.y)
    }

    pub fn is_empty(&self) -> bool {
        !(self.size.x > 0.0 && self.size.y > 0.0)
    }

    /// Overlap of two regions, or `None` when they do not intersect.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let ll_x = self.lower_left.x.max(other.lower_left.x);
        let ll_y = self.lower_left.y.max(other.lower_left.y);
        let ur = self.upper_right();
        let other_ur = other.upper_right();
        let ur_x = ur.x.min(other_ur.x);
        let ur_y = ur.y.min(other_ur.y);

        if ur_x <= ll_x || ur_y <= ll_y {
            return None;
        }
        Some(Region::new(Vec2::new(ll_x, ll_y), Vec2::new(ur_x - ll_x, ur_y - ll_y)))
    }

    pub fn contains(&self, other: &Region) -> bool {
        let ur = self.upper_right();
        let other_ur = other.upper_right();
        other.lower_left.x >= self.lower_left.x
            && other.lower_left.y >= self.lower_left.y
            && other_ur.x <= ur.x
            && other_ur.y <= ur.y
    }
}

/// Observer position for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Viewpoint {
    /// Distance from the observer to the sun center.
    pub distance: f64,
    /// Heliographic latitude of the observer, radians.
    #[serde(default)]
    pub latitude: f64,
    /// Heliographic longitude of the observer, radians.
    #[serde(default)]
    pub longitude: f64,
}

/// Immutable per-frame record, parsed once when the series is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(default)]
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub region: Region,
    pub pixel_width: u32,
    pub pixel_height: u32,
    #[serde(default = "default_response")]
    pub response: f32,
    #[serde(default)]
    pub viewpoint: Viewpoint,
}

fn default_response() -> f32 {
    1.0
}

impl FrameMetadata {
    /// Physical units covered by one full-resolution pixel, horizontally.
    pub fn units_per_pixel(&self) -> f64 {
        self.region.width() / self.pixel_width.max(1) as f64
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Checks that a parsed metadata list is usable and renumbers frames by position.
pub fn normalize_frames(mut frames: Vec<FrameMetadata>) -> crate::Result<Vec<FrameMetadata>> {
    if frames.is_empty() {
        return Err(crate::StreamError::Metadata("series contains no frames".into()));
    }

    for (i, frame) in frames.iter_mut().enumerate() {
        if frame.pixel_width == 0 || frame.pixel_height == 0 {
            return Err(crate::StreamError::Metadata(format!(
                "frame {} has zero pixel dimensions",
                i
            )));
        }
        if frame.region.is_empty() {
            return Err(crate::StreamError::Metadata(format!(
                "frame {} has an empty physical region",
                i
            )));
        }
        frame.index = i;
    }

    if frames.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
        return Err(crate::StreamError::Metadata(
            "frame timestamps are not in ascending order".into(),
        ));
    }

    Ok(frames)
}

/// Size of the drawing surface, in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// The part of the camera state the pipeline needs: the physical extent of the
/// field of view along the viewport height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSnapshot {
    pub field_width: f64,
}

impl CameraSnapshot {
    pub const fn new(field_width: f64) -> Self {
        Self { field_width }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::TimeZone;

    /// A square frame of `pixels`×`pixels` covering [-1, 1]² at `minute` past noon.
    pub fn frame(index: usize, minute: u32, pixels: u32) -> FrameMetadata {
        FrameMetadata {
            index,
            timestamp: Utc.with_ymd_and_hms(2014, 1, 1, 12, minute, 0).unwrap(),
            region: Region::new(Vec2::new(-1.0, -1.0), Vec2::new(2.0, 2.0)),
            pixel_width: pixels,
            pixel_height: pixels,
            response: 1.0,
            viewpoint: Viewpoint::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::frame;
    use super::*;

    #[test]
    fn test_region_intersection() {
        let a = Region::new(Vec2::new(0.0, 0.0), Vec2::new(4.0, 4.0));
        let b = Region::new(Vec2::new(2.0, 1.0), Vec2::new(4.0, 2.0));
        let i = a.intersection(&b).unwrap();
        assert_eq!(i, Region::new(Vec2::new(2.0, 1.0), Vec2::new(2.0, 2.0)));
        assert!(a.contains(&i));

        let far = Region::new(Vec2::new(10.0, 10.0), Vec2::new(1.0, 1.0));
        assert!(a.intersection(&far).is_none());
    }

    #[test]
    fn test_normalize_renumbers_and_validates() {
        let frames = vec![frame(7, 0, 64), frame(9, 5, 64)];
        let frames = normalize_frames(frames).unwrap();
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[1].index, 1);

        let out_of_order = vec![frame(0, 5, 64), frame(1, 0, 64)];
        assert!(normalize_frames(out_of_order).is_err());
        assert!(normalize_frames(Vec::new()).is_err());
    }

    #[test]
    fn test_metadata_json_defaults() {
        let json = r#"{
            "timestamp": "2014-01-01T12:00:00Z",
            "region": {"lower_left": {"x": -1.0, "y": -1.0}, "size": {"x": 2.0, "y": 2.0}},
            "pixel_width": 4096,
            "pixel_height": 4096
        }"#;
        let meta: FrameMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.response, 1.0);
        assert_eq!(meta.viewpoint, Viewpoint::default());
        assert!((meta.units_per_pixel() - 2.0 / 4096.0).abs() < 1e-12);
    }
}
