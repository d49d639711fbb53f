//! Image sources: where frame metadata comes from and who performs decodes.
//!
//! A source exposes the metadata of every frame of a series, the resolution
//! levels each frame can be decoded at, and an asynchronous decode operation.
//! The reader thread is the only caller of [`ImageSource::request_decode`] for
//! a given stream and never issues two decodes at once.

mod local;
mod remote;

pub use local::{LocalImageSource, SeriesManifest, SERIES_MANIFEST};
pub use remote::RemoteImageSource;

use crate::cache::Interval;
use crate::decoder::DecodedTile;
use crate::metadata::FrameMetadata;
use crate::resolution::{ResolutionSet, SubImageRequest};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Receives the outcome of a decode. A source may call it several times with
/// tiles of increasing coverage (progressive passes); the decode is over once
/// a tile with coverage 1.0 or an error has been delivered.
pub type DecodeCallback = Box<dyn FnMut(Result<DecodedTile>) + Send>;

pub trait ImageSource: Send + Sync {
    /// Human readable name for logs and status display.
    fn name(&self) -> &str;

    /// Metadata of every frame, in time order. Fixed for the life of the source.
    fn frame_metadata(&self) -> Arc<[FrameMetadata]>;

    /// Levels available for `frame`, coarsest first.
    fn resolution_levels(&self, frame: usize) -> Result<Arc<ResolutionSet>>;

    /// Starts decoding `request`. The callback may run on any thread, including
    /// the caller's before this returns.
    fn request_decode(&self, request: &SubImageRequest, on_result: DecodeCallback);

    /// Fetches whatever backs the frames in `interval` ahead of time. Returns
    /// the number of frames touched.
    fn prefetch(&self, _interval: &Interval<DateTime<Utc>>) -> Result<usize> {
        Ok(0)
    }

    /// Releases connections and buffers. Called once, during teardown.
    fn close(&self) {}
}

/// Indices of the frames whose timestamps fall inside `interval`.
pub fn frames_in_interval(
    frames: &[FrameMetadata],
    interval: &Interval<DateTime<Utc>>,
) -> std::ops::Range<usize> {
    let start = frames.partition_point(|f| f.timestamp < interval.start);
    let end = frames.partition_point(|f| f.timestamp < interval.end);
    start..end.max(start)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::testing::frame;

    #[test]
    fn test_frames_in_interval() {
        let frames: Vec<_> = (0..5).map(|i| frame(i, i as u32 * 10, 16)).collect();
        let interval = Interval::new(frames[1].timestamp, frames[3].timestamp);
        assert_eq!(frames_in_interval(&frames, &interval), 1..3);

        let empty = Interval::new(frames[3].timestamp, frames[1].timestamp);
        assert!(frames_in_interval(&frames, &empty).is_empty());
    }
}
