//! The per-layer entry point: owns one stream's threads and turns viewport,
//! region and time changes into decode requests.

pub mod playback;

use crate::cache::{CacheSnapshot, CacheStatus, Interval};
use crate::config::{DisplayPolicy, PlaybackSpeed, StreamConfig};
use crate::events::Subscription;
use crate::metadata::{CameraSnapshot, FrameMetadata, Region, Viewport};
use crate::pipeline::{
    CurrentImage, DisplaySink, Handoff, HandoffKind, LayerStatus, ReadJob, Reader, Renderer, Shared, Target,
};
use crate::resolution::{select_resolution, SubImageRequest};
use crate::source::ImageSource;
use crate::{Result, StreamError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use self::playback::{nearest_frame, AnimationMode, Playback};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Lifecycle of a [`StreamView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Uninitialized = 0,
    Active = 1,
    Abolishing = 2,
    Abolished = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Uninitialized,
            1 => StreamState::Active,
            2 => StreamState::Abolishing,
            _ => StreamState::Abolished,
        }
    }
}

/// How to pick the displayed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSelector {
    Index(usize),
    /// The frame nearest in time.
    Time(DateTime<Utc>),
}

/// Snapshot of a stream for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub state: StreamState,
    pub frame: usize,
    pub frame_count: usize,
    pub frame_status: CacheStatus,
    /// Frames `0..n` all have something to show.
    pub partially_cached_until: usize,
    pub frame_rate: f32,
    pub layer: LayerStatus,
}

struct Workers {
    reader: JoinHandle<()>,
    renderer: JoinHandle<()>,
}

struct Attached {
    shared: Arc<Shared>,
    source: Arc<dyn ImageSource>,
    workers: Mutex<Option<Workers>>,
}

/// One displayed image stream.
///
/// Setters are cheap and never block: they recompute the sub-image request
/// and, only if it differs from the last one issued, bump the request
/// generation and hand the request to the reader thread. Everything else
/// happens on the `<name>-reader` and `<name>-render` threads.
pub struct StreamView {
    name: String,
    config: StreamConfig,
    sink: Arc<dyn DisplaySink>,
    state: Arc<AtomicU8>,
    attached: Option<Attached>,

    viewport: Viewport,
    camera: Option<CameraSnapshot>,
    region: Option<Region>,
    frame: usize,

    last_issued: Option<SubImageRequest>,
    /// Region the last computed request was cut for.
    requested_region: Option<Region>,
    generation: u64,
    decodes_issued: u64,
    playback: Playback,
}

impl StreamView {
    pub fn new(name: impl Into<String>, config: StreamConfig, sink: Arc<dyn DisplaySink>) -> Self {
        Self {
            name: name.into(),
            sink,
            state: Arc::new(AtomicU8::new(StreamState::Uninitialized as u8)),
            attached: None,
            viewport: Viewport::default(),
            camera: None,
            region: None,
            frame: 0,
            last_issued: None,
            requested_region: None,
            generation: 0,
            decodes_issued: 0,
            playback: Playback::new(config.playback.speed),
            config,
        }
    }

    /// Takes ownership of the source and starts the reader and render threads.
    pub fn attach(&mut self, source: Arc<dyn ImageSource>) -> Result<()> {
        match self.state() {
            StreamState::Uninitialized => {}
            StreamState::Active => return Err(StreamError::AlreadyAttached),
            StreamState::Abolishing | StreamState::Abolished => return Err(StreamError::Abolished),
        }

        let frames = source.frame_metadata();
        if frames.is_empty() {
            return Err(StreamError::Metadata(format!("{} has no frames", source.name())));
        }
        let levels = (0..frames.len())
            .map(|frame| source.resolution_levels(frame))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "{}: attaching '{}' ({} frames, {:?})",
            self.name,
            source.name(),
            frames.len(),
            self.config.display_policy
        );

        let shared = Arc::new(Shared::new(self.name.clone(), self.config.clone(), frames, levels));

        let reader = Reader::new(shared.clone(), source.clone());
        let reader = thread::Builder::new()
            .name(format!("{}-reader", self.name))
            .spawn(move || reader.run())?;

        let renderer = Renderer::new(shared.clone(), self.sink.clone());
        let renderer = match thread::Builder::new()
            .name(format!("{}-render", self.name))
            .spawn(move || renderer.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.mailbox.close();
                let _ = reader.join();
                return Err(e.into());
            }
        };

        self.attached = Some(Attached {
            shared,
            source,
            workers: Mutex::new(Some(Workers { reader, renderer })),
        });
        self.state.store(StreamState::Active as u8, Ordering::SeqCst);
        self.refresh()?;
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<bool> {
        self.ensure_usable()?;
        self.viewport = viewport;
        self.refresh()
    }

    pub fn set_camera(&mut self, camera: CameraSnapshot) -> Result<bool> {
        self.ensure_usable()?;
        self.camera = Some(camera);
        self.refresh()
    }

    /// Changes the visible physical region. If that changes the request, a
    /// new cache status generation starts: tiles cut for the old region no
    /// longer count as complete.
    pub fn set_region(&mut self, region: Region) -> Result<bool> {
        self.ensure_usable()?;
        if region.is_empty() {
            return Err(StreamError::Metadata(format!("empty region {:?}", region)));
        }
        if self.region == Some(region) {
            return Ok(false);
        }
        self.region = Some(region);
        self.refresh()
    }

    pub fn set_frame(&mut self, selector: FrameSelector) -> Result<bool> {
        self.ensure_usable()?;
        let frames = self.frames()?;
        let frame = match selector {
            FrameSelector::Index(frame) if frame < frames.len() => frame,
            FrameSelector::Index(frame) => {
                return Err(StreamError::InvalidFrame {
                    frame,
                    count: frames.len(),
                })
            }
            FrameSelector::Time(time) => nearest_frame(&frames, time).unwrap_or(0),
        };
        self.frame = frame;
        self.refresh()
    }

    /// Advances playback by one frame. Under [`DisplayPolicy::TargetOnly`] the
    /// stream holds until the current target is complete. Returns the frame now
    /// selected, or `None` when playback has stopped.
    pub fn step(&mut self, mode: AnimationMode) -> Result<Option<usize>> {
        self.ensure_usable()?;
        let frames = self.frames()?;

        if self.config.display_policy == DisplayPolicy::TargetOnly && !self.target_displayed() {
            return Ok(Some(self.frame));
        }

        match self.playback.next_frame(mode, self.frame, frames.len()) {
            Some(next) => {
                self.set_frame(FrameSelector::Index(next))?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    /// Timed playback: moves to the next frame once the current one has been
    /// shown long enough at the configured speed. With
    /// `playback.hold_at_cached` set, frames past
    /// [`StreamView::maximum_accessible_frame`] are not entered. Returns the
    /// frame entered, or `None` when it is not time yet or playback holds.
    pub fn advance(&mut self, mode: AnimationMode, now: Instant) -> Result<Option<usize>> {
        self.ensure_usable()?;
        let frames = self.frames()?;

        if self.config.display_policy == DisplayPolicy::TargetOnly && !self.target_displayed() {
            return Ok(None);
        }
        let accessible = self
            .config
            .playback
            .hold_at_cached
            .then(|| self.maximum_accessible_frame().map_or(0, |f| f + 1));

        match self.playback.advance(mode, &frames, self.frame, accessible, now) {
            Some(next) => {
                self.set_frame(FrameSelector::Index(next))?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    pub fn set_speed(&mut self, speed: PlaybackSpeed) {
        log::debug!("{}: playback speed {:?}", self.name, speed);
        self.playback.set_speed(speed);
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.playback.speed()
    }

    /// Last frame timed playback may enter: the end of the leading run of
    /// frames with something decoded. `None` while not even the first is.
    pub fn maximum_accessible_frame(&self) -> Option<usize> {
        let attached = self.attached.as_ref()?;
        let cached = attached.shared.status.read().partially_cached_until();
        cached.min(attached.shared.frames.len()).checked_sub(1)
    }

    /// Registers a time range for background fetching. Only the parts not
    /// requested before reach the source.
    pub fn preload(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        self.ensure_usable()?;
        let attached = self.attached()?;
        attached.shared.mailbox.preload(Interval::new(start, end));
        Ok(())
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        Ok(self.attached()?.shared.events.subscribe())
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.attached
            .as_ref()
            .is_some_and(|attached| attached.shared.events.unsubscribe(id))
    }

    /// The image last accepted by the renderer. Fetching it re-arms the
    /// renderer's redraw request.
    pub fn current_image(&self) -> Option<CurrentImage> {
        let attached = self.attached.as_ref()?;
        let current = attached.shared.current.lock().clone();
        attached.shared.redraw_pending.store(false, Ordering::SeqCst);
        current
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn frame_count(&self) -> usize {
        self.attached.as_ref().map(|a| a.shared.frames.len()).unwrap_or(0)
    }

    pub fn frame_metadata(&self) -> Option<Arc<[FrameMetadata]>> {
        self.attached.as_ref().map(|a| a.shared.frames.clone())
    }

    pub fn last_request(&self) -> Option<SubImageRequest> {
        self.last_issued
    }

    pub fn decode_requests_issued(&self) -> u64 {
        self.decodes_issued
    }

    pub fn frame_rate(&self) -> f32 {
        self.attached
            .as_ref()
            .map(|a| a.shared.frame_rate.lock().rate())
            .unwrap_or(0.0)
    }

    pub fn layer_status(&self) -> LayerStatus {
        self.attached
            .as_ref()
            .map(|a| a.shared.layer_status.lock().clone())
            .unwrap_or_default()
    }

    pub fn cache_snapshot(&self) -> Option<CacheSnapshot> {
        self.attached.as_ref().map(|a| a.shared.status.read().snapshot())
    }

    pub fn status(&self) -> StreamStatus {
        let (frame_status, partially_cached_until) = self
            .attached
            .as_ref()
            .map(|a| {
                let status = a.shared.status.read();
                let frame_status = match self.last_issued {
                    Some(target) if target.frame == self.frame => status.status_at(target.frame, target.level),
                    _ => status.status(self.frame),
                };
                (frame_status, status.partially_cached_until())
            })
            .unwrap_or((CacheStatus::Empty, 0));

        StreamStatus {
            state: self.state(),
            frame: self.frame,
            frame_count: self.frame_count(),
            frame_status,
            partially_cached_until,
            frame_rate: self.frame_rate(),
            layer: self.layer_status(),
        }
    }

    /// Starts teardown and returns immediately. The threads are joined and the
    /// source closed on the blocking pool; the state reaches
    /// [`StreamState::Abolished`] when that finishes. Calling it again is a
    /// no-op.
    pub fn abolish(&self) {
        let from = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
            match StreamState::from_u8(s) {
                StreamState::Uninitialized | StreamState::Active => Some(StreamState::Abolishing as u8),
                StreamState::Abolishing | StreamState::Abolished => None,
            }
        });
        if from.is_err() {
            return;
        }

        let Some(attached) = &self.attached else {
            self.state.store(StreamState::Abolished as u8, Ordering::SeqCst);
            log::info!("{}: abolished before attach", self.name);
            return;
        };

        log::info!("{}: abolishing", self.name);
        let shared = attached.shared.clone();
        shared.shutdown.store(true, Ordering::SeqCst);
        shared.mailbox.close();
        shared.handoff.close();

        let workers = attached.workers.lock().take();
        let source = attached.source.clone();
        let state = self.state.clone();
        let name = self.name.clone();
        smol::unblock(move || {
            // Closing first lets the source end an in-flight decode early.
            source.close();
            if let Some(workers) = workers {
                if workers.reader.join().is_err() {
                    log::error!("{}: reader thread panicked", name);
                }
                if workers.renderer.join().is_err() {
                    log::error!("{}: render thread panicked", name);
                }
            }
            shared.events.close();
            state.store(StreamState::Abolished as u8, Ordering::SeqCst);
            log::info!("{}: abolished", name);
        })
        .detach();
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            StreamState::Abolishing | StreamState::Abolished => Err(StreamError::Abolished),
            _ => Ok(()),
        }
    }

    fn attached(&self) -> Result<&Attached> {
        self.attached.as_ref().ok_or(StreamError::NotAttached)
    }

    fn frames(&self) -> Result<Arc<[FrameMetadata]>> {
        Ok(self.attached()?.shared.frames.clone())
    }

    fn target_displayed(&self) -> bool {
        let Some(attached) = &self.attached else {
            return false;
        };
        let current = attached.shared.current.lock();
        match (current.as_ref(), self.last_issued) {
            (Some(image), Some(target)) => image.tile.request == target && image.tile.is_complete(),
            _ => false,
        }
    }

    /// Recomputes the request for the current parameters and issues it if it
    /// changed. Returns whether a decode was posted to the reader.
    fn refresh(&mut self) -> Result<bool> {
        let Some(attached) = &self.attached else {
            return Ok(false);
        };
        if self.viewport.height == 0 {
            return Ok(false);
        }

        let shared = attached.shared.clone();
        let meta = &shared.frames[self.frame];
        let levels = &shared.levels[self.frame];
        let region = self.region.unwrap_or(meta.region);
        let camera_width = self.camera.map(|c| c.field_width).unwrap_or_else(|| region.height());

        let request = select_resolution(self.viewport.height, camera_width, meta, levels, &region);
        let region_changed = self.requested_region.is_some_and(|previous| previous != region);
        self.requested_region = Some(region);
        if self.last_issued == Some(request) {
            return Ok(false);
        }
        if region_changed {
            let generation = shared.status.write().begin_generation();
            log::debug!("{}: region changed, status generation {}", self.name, generation);
        }
        Ok(self.issue(&shared, request))
    }

    fn issue(&mut self, shared: &Shared, request: SubImageRequest) -> bool {
        self.generation += 1;
        let generation = self.generation;
        self.last_issued = Some(request);
        shared.status.write().select_level(request.level);
        {
            let mut target = shared.target.lock();
            *target = Target {
                generation,
                request: Some(request),
                policy: self.config.display_policy,
            };
        }

        let (exact, preview) = {
            let tiles = shared.tiles.lock();
            match tiles.exact(&request) {
                Some(tile) => (Some(tile), None),
                None if self.config.display_policy == DisplayPolicy::BestAvailable => {
                    (None, tiles.preview(request.frame, request.level))
                }
                None => (None, None),
            }
        };

        if let Some(tile) = exact {
            log::debug!(
                "{}: frame {} level {} served from tile cache",
                self.name,
                request.frame,
                request.level
            );
            shared.hand_off(Handoff {
                tile,
                generation,
                sequence: shared.next_sequence(),
                kind: HandoffKind::Exact,
            });
            return false;
        }

        if let Some(tile) = preview {
            shared.hand_off(Handoff {
                tile,
                generation,
                sequence: shared.next_sequence(),
                kind: HandoffKind::Preview,
            });
        }

        if let Some(displaced) = shared.mailbox.post(ReadJob { request, generation }) {
            log::debug!(
                "{}: request for frame {} level {} superseded before decoding",
                self.name,
                displaced.request.frame,
                displaced.request.level
            );
        }
        self.decodes_issued += 1;
        log::debug!(
            "{}: requested frame {} level {} {:?} (generation {})",
            self.name,
            request.frame,
            request.level,
            request.sub_image,
            generation
        );
        true
    }
}

impl Drop for StreamView {
    fn drop(&mut self) {
        self.abolish();
    }
}
