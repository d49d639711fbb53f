//! Progressive image streaming and cache-coherent rendering for time series of
//! solar observation frames.
//!
//! A [`StreamView`] owns one stream: it turns viewport, region and time changes
//! into [`SubImageRequest`]s, a reader thread decodes them through an
//! [`ImageSource`], and a render thread hands accepted tiles to a
//! [`DisplaySink`]. Stale results never replace newer ones, and the UI thread
//! never blocks.

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod metadata;
pub mod pipeline;
pub mod resolution;
pub mod source;
pub mod view;

pub use cache::{CacheSnapshot, CacheStatus, CacheStatusTable, Interval, RequestCache, TileCache};
pub use config::{DisplayPolicy, PlaybackConfig, PlaybackSpeed, StreamConfig};
pub use decoder::{DecodedTile, PixelFormat};
pub use error::{Result, StreamError};
pub use events::{StreamEvent, Subscription};
pub use metadata::{CameraSnapshot, FrameMetadata, Region, Vec2, Viewport};
pub use pipeline::{CurrentImage, DisplaySink, LayerStatus, LoggingSink, Placement};
pub use resolution::{select_resolution, ResolutionLevel, ResolutionSet, SubImage, SubImageRequest};
pub use source::{ImageSource, LocalImageSource, RemoteImageSource};
pub use view::playback::AnimationMode;
pub use view::{FrameSelector, StreamState, StreamStatus, StreamView};
