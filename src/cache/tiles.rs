//! Decoded tile store with display-recency eviction.

use crate::decoder::DecodedTile;
use crate::resolution::SubImageRequest;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

struct FrameTiles {
    // At most one tile per level.
    tiles: SmallVec<[Arc<DecodedTile>; 4]>,
    last_used: u64,
}

/// Keeps recently displayed tiles so that returning to a frame is free and so
/// that a coarser tile can stand in while a finer one decodes.
///
/// Eviction releases the least recently displayed frames first and never
/// touches the pinned (currently displayed) frame, even if that means staying
/// over budget.
pub struct TileCache {
    budget_bytes: usize,
    total_bytes: usize,
    frames: HashMap<usize, FrameTiles>,
    clock: u64,
    pinned: Option<usize>,
}

impl TileCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            total_bytes: 0,
            frames: HashMap::new(),
            clock: 0,
            pinned: None,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn contains_frame(&self, frame: usize) -> bool {
        self.frames.contains_key(&frame)
    }

    /// Stores a tile, replacing any previous tile for the same frame and level.
    pub fn insert(&mut self, tile: Arc<DecodedTile>) {
        self.clock += 1;
        let clock = self.clock;
        let frame = tile.frame();
        let entry = self.frames.entry(frame).or_insert_with(|| FrameTiles {
            tiles: SmallVec::new(),
            last_used: clock,
        });

        if let Some(pos) = entry.tiles.iter().position(|t| t.level() == tile.level()) {
            let old = entry.tiles.remove(pos);
            self.total_bytes -= old.byte_len();
        }
        self.total_bytes += tile.byte_len();
        entry.tiles.push(tile);
        entry.last_used = clock;

        self.evict();
    }

    /// A complete tile for exactly this request.
    pub fn exact(&self, request: &SubImageRequest) -> Option<Arc<DecodedTile>> {
        self.frames
            .get(&request.frame)?
            .tiles
            .iter()
            .find(|t| t.request == *request && t.is_complete())
            .cloned()
    }

    /// Best stand-in for `frame`: the finest tile at or below `max_level`, or
    /// failing that the coarsest tile above it.
    pub fn preview(&self, frame: usize, max_level: usize) -> Option<Arc<DecodedTile>> {
        let tiles = &self.frames.get(&frame)?.tiles;
        tiles
            .iter()
            .filter(|t| t.level() <= max_level)
            .max_by_key(|t| t.level())
            .or_else(|| tiles.iter().min_by_key(|t| t.level()))
            .cloned()
    }

    /// Marks `frame` as the one on screen: most recently used and not evictable.
    pub fn pin(&mut self, frame: usize) {
        self.clock += 1;
        if let Some(entry) = self.frames.get_mut(&frame) {
            entry.last_used = self.clock;
        }
        self.pinned = Some(frame);
        self.evict();
    }

    fn evict(&mut self) {
        while self.total_bytes > self.budget_bytes {
            let victim = self
                .frames
                .iter()
                .filter(|(frame, _)| Some(**frame) != self.pinned)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(frame, _)| *frame);

            let Some(frame) = victim else {
                break;
            };
            if let Some(entry) = self.frames.remove(&frame) {
                let freed: usize = entry.tiles.iter().map(|t| t.byte_len()).sum();
                self.total_bytes -= freed;
                log::debug!("Evicted frame {} from tile cache ({} bytes)", frame, freed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PixelFormat;
    use crate::resolution::SubImage;
    use std::time::Duration;

    fn tile(frame: usize, level: usize, bytes: usize, coverage: f32) -> Arc<DecodedTile> {
        Arc::new(DecodedTile {
            request: SubImageRequest {
                frame,
                level,
                sub_image: SubImage::new(0, 0, bytes as u32, 1),
            },
            pixels: vec![0; bytes],
            format: PixelFormat::Gray8,
            width: bytes as u32,
            height: 1,
            coverage,
            decode_time: Duration::ZERO,
        })
    }

    #[test]
    fn test_exact_requires_complete_tile() {
        let mut cache = TileCache::new(1000);
        let partial = tile(0, 1, 10, 0.5);
        cache.insert(partial.clone());
        assert!(cache.exact(&partial.request).is_none());

        let complete = tile(0, 1, 10, 1.0);
        cache.insert(complete.clone());
        assert!(cache.exact(&complete.request).is_some());
        // Same level replaced, not duplicated.
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn test_preview_prefers_finest_at_or_below_target() {
        let mut cache = TileCache::new(1000);
        cache.insert(tile(4, 0, 4, 1.0));
        cache.insert(tile(4, 2, 16, 1.0));
        cache.insert(tile(4, 3, 64, 1.0));

        assert_eq!(cache.preview(4, 2).unwrap().level(), 2);
        assert_eq!(cache.preview(4, 1).unwrap().level(), 0);
        assert!(cache.preview(5, 3).is_none());

        let mut coarse_missing = TileCache::new(1000);
        coarse_missing.insert(tile(1, 3, 8, 1.0));
        assert_eq!(coarse_missing.preview(1, 0).unwrap().level(), 3);
    }

    #[test]
    fn test_evicts_least_recently_displayed() {
        let mut cache = TileCache::new(30);
        cache.insert(tile(0, 0, 10, 1.0));
        cache.insert(tile(1, 0, 10, 1.0));
        cache.insert(tile(2, 0, 10, 1.0));
        cache.pin(0);

        cache.insert(tile(3, 0, 10, 1.0));
        assert!(cache.contains_frame(0));
        assert!(!cache.contains_frame(1));
        assert!(cache.contains_frame(2));
        assert!(cache.contains_frame(3));
        assert_eq!(cache.total_bytes(), 30);
    }

    #[test]
    fn test_never_evicts_pinned_frame() {
        let mut cache = TileCache::new(5);
        cache.insert(tile(9, 0, 4, 1.0));
        cache.pin(9);
        cache.insert(tile(9, 1, 20, 1.0));
        assert!(cache.contains_frame(9));
        assert_eq!(cache.total_bytes(), 24);
    }
}
