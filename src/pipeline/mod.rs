//! The two worker threads of a stream and the state they share with the view.
//!
//! The view posts [`ReadJob`]s to the reader's [`Mailbox`]; the reader decodes
//! one request at a time and puts every progressive pass into the handoff
//! [`LatestSlot`]; the renderer takes from the slot, drops anything stale,
//! uploads the rest to the [`DisplaySink`] and publishes it as the current
//! image. Both channels hold at most one pending value, so the newest request
//! and the newest tile always win.

mod reader;
mod renderer;
mod sink;
mod slot;

pub use reader::{Mailbox, ReadJob, Reader, Work};
pub use renderer::Renderer;
pub use sink::{DisplaySink, LoggingSink, Placement};
pub use slot::LatestSlot;

#[cfg(test)]
pub(crate) use sink::testing;

use crate::cache::{CacheStatusTable, RequestCache, TileCache};
use crate::config::{DisplayPolicy, StreamConfig};
use crate::decoder::DecodedTile;
use crate::events::EventHub;
use crate::metadata::FrameMetadata;
use crate::resolution::{ResolutionSet, SubImageRequest};
use crate::view::playback::FrameRateCounter;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffKind {
    /// Decoded (or cached) for exactly the target request.
    Exact,
    /// A cached tile of the target frame at another level, shown until the
    /// exact one arrives.
    Preview,
}

/// A tile travelling from the reader (or the view, for cache hits) to the
/// renderer.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub tile: Arc<DecodedTile>,
    /// Request generation the tile was produced for.
    pub generation: u64,
    /// Stream-wide order of handoffs; later passes carry larger numbers.
    pub sequence: u64,
    pub kind: HandoffKind,
}

/// What the renderer should be showing.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub generation: u64,
    pub request: Option<SubImageRequest>,
    pub policy: DisplayPolicy,
}

/// The image last accepted by the renderer.
#[derive(Debug, Clone)]
pub struct CurrentImage {
    pub tile: Arc<DecodedTile>,
    pub placement: Placement,
    pub generation: u64,
    pub kind: HandoffKind,
}

/// User-visible health of the layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LayerStatus {
    #[default]
    Ok,
    Degraded(String),
}

pub(crate) struct Shared {
    pub name: String,
    pub config: StreamConfig,
    pub frames: Arc<[FrameMetadata]>,
    /// Levels of every frame, fetched from the source once at attach time.
    pub levels: Vec<Arc<ResolutionSet>>,
    pub status: RwLock<CacheStatusTable>,
    pub requests: Mutex<RequestCache<DateTime<Utc>>>,
    pub tiles: Mutex<TileCache>,
    pub target: Mutex<Target>,
    pub current: Mutex<Option<CurrentImage>>,
    pub redraw_pending: AtomicBool,
    pub frame_rate: Mutex<FrameRateCounter>,
    pub layer_status: Mutex<LayerStatus>,
    pub events: EventHub,
    pub mailbox: Mailbox,
    pub handoff: LatestSlot<Handoff>,
    pub shutdown: AtomicBool,
    sequence: AtomicU64,
}

impl Shared {
    pub fn new(
        name: String,
        config: StreamConfig,
        frames: Arc<[FrameMetadata]>,
        levels: Vec<Arc<ResolutionSet>>,
    ) -> Self {
        let policy = config.display_policy;
        Self {
            name,
            status: RwLock::new(CacheStatusTable::new(frames.len())),
            requests: Mutex::new(RequestCache::new()),
            tiles: Mutex::new(TileCache::new(config.tile_cache_bytes)),
            target: Mutex::new(Target {
                generation: 0,
                request: None,
                policy,
            }),
            current: Mutex::new(None),
            redraw_pending: AtomicBool::new(false),
            frame_rate: Mutex::new(FrameRateCounter::default()),
            layer_status: Mutex::new(LayerStatus::Ok),
            events: EventHub::new(),
            mailbox: Mailbox::new(),
            handoff: LatestSlot::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            config,
            frames,
            levels,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Puts `handoff` in the slot unless a handoff of a later generation (or
    /// a later pass of the same one) is already pending. Both the reader and
    /// the view write here. Returns whether it was stored.
    pub fn hand_off(&self, handoff: Handoff) -> bool {
        let key = (handoff.generation, handoff.sequence);
        match self.handoff.put_newest(handoff, |h| (h.generation, h.sequence)) {
            Some(refused) => (refused.generation, refused.sequence) != key,
            None => true,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn set_layer_status(&self, status: LayerStatus) {
        let mut current = self.layer_status.lock();
        if *current != status {
            match &status {
                LayerStatus::Ok => log::info!("{}: layer recovered", self.name),
                LayerStatus::Degraded(message) => log::warn!("{}: layer degraded: {}", self.name, message),
            }
            *current = status;
        }
    }
}
