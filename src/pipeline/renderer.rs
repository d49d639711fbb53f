use super::{CurrentImage, DisplaySink, Handoff, HandoffKind, Placement, Shared};
use crate::config::DisplayPolicy;
use crate::events::StreamEvent;
use crate::resolution::{tile_region, ResolutionLevel};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Body of the `<name>-render` thread.
///
/// Accepts a handoff only if it belongs to the current request generation, is
/// newer than the last accepted one, and matches the target under the display
/// policy. Accepted tiles are uploaded, cached and published as the current
/// image.
pub struct Renderer {
    shared: Arc<Shared>,
    sink: Arc<dyn DisplaySink>,
    last_accepted: Option<(u64, u64)>,
}

impl Renderer {
    pub(crate) fn new(shared: Arc<Shared>, sink: Arc<dyn DisplaySink>) -> Self {
        Self {
            shared,
            sink,
            last_accepted: None,
        }
    }

    pub fn run(mut self) {
        log::info!("{}: renderer started", self.shared.name);
        while let Some(handoff) = self.shared.handoff.take() {
            if self.shared.is_shutting_down() {
                break;
            }
            self.render(handoff);
        }
        log::info!("{}: renderer stopped", self.shared.name);
    }

    /// Returns whether the tile went on screen.
    pub fn render(&mut self, handoff: Handoff) -> bool {
        if !self.accepts(&handoff) {
            return false;
        }

        let tile = handoff.tile;
        let frame = tile.frame();
        let Some(meta) = self.shared.frames.get(frame) else {
            log::warn!("{}: tile for unknown frame {} dropped", self.shared.name, frame);
            return false;
        };
        let Some(level) = self.level_of(frame, tile.level()) else {
            log::warn!(
                "{}: tile for unknown level {} of frame {} dropped",
                self.shared.name,
                tile.level(),
                frame
            );
            return false;
        };

        let placement = Placement {
            frame,
            level: tile.level(),
            region: tile_region(meta, &level, &tile.request.sub_image),
        };
        self.sink.upload(&tile, &placement);

        {
            let mut tiles = self.shared.tiles.lock();
            tiles.insert(tile.clone());
            tiles.pin(frame);
        }

        self.last_accepted = Some((handoff.generation, handoff.sequence));
        let previous_frame = self.shared.current.lock().replace(CurrentImage {
            tile: tile.clone(),
            placement,
            generation: handoff.generation,
            kind: handoff.kind,
        });
        if previous_frame.map(|c| c.tile.frame()) != Some(frame) {
            self.shared.frame_rate.lock().record(frame, Instant::now());
        }

        // One redraw request per image the UI has not fetched yet.
        if !self.shared.redraw_pending.swap(true, Ordering::SeqCst) {
            self.sink.request_redraw();
        }

        self.shared.events.emit(StreamEvent::TileAccepted {
            request: tile.request,
            coverage: tile.coverage,
        });
        true
    }

    fn accepts(&self, handoff: &Handoff) -> bool {
        let target = *self.shared.target.lock();
        let tile = &handoff.tile;

        if handoff.generation != target.generation {
            log::debug!(
                "{}: dropping generation {} tile (current {})",
                self.shared.name,
                handoff.generation,
                target.generation
            );
            return false;
        }
        if self
            .last_accepted
            .is_some_and(|last| (handoff.generation, handoff.sequence) <= last)
        {
            log::debug!("{}: dropping superseded pass {}", self.shared.name, handoff.sequence);
            return false;
        }

        let Some(request) = target.request else {
            return false;
        };
        match (handoff.kind, target.policy) {
            (HandoffKind::Exact, DisplayPolicy::BestAvailable) => tile.request == request,
            (HandoffKind::Exact, DisplayPolicy::TargetOnly) => tile.request == request && tile.is_complete(),
            (HandoffKind::Preview, DisplayPolicy::BestAvailable) => tile.frame() == request.frame,
            (HandoffKind::Preview, DisplayPolicy::TargetOnly) => false,
        }
    }

    fn level_of(&self, frame: usize, level: usize) -> Option<ResolutionLevel> {
        self.shared.levels.get(frame)?.level(level).copied()
    }
}
