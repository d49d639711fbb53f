//! Per-frame, per-level decode completeness.

use smallvec::SmallVec;

/// How much of a frame (or of one of its levels) has been decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CacheStatus {
    #[default]
    Empty,
    Partial,
    Complete,
}

#[derive(Debug, Clone, Copy, Default)]
struct LevelEntry {
    status: CacheStatus,
    coverage: f32,
}

/// Tracks decode progress for every (frame, level) pair of a series.
///
/// Within one generation transitions only move forward. A new generation
/// (started when the requested region changes) demotes `Complete` entries to
/// `Partial`: the data is still there, but no longer covers the whole extent
/// that is now wanted.
///
/// A frame counts as complete only at the selected level. A finer or coarser
/// level that happens to be complete makes the frame showable, not complete.
#[derive(Debug, Clone)]
pub struct CacheStatusTable {
    frames: Vec<SmallVec<[LevelEntry; 8]>>,
    generation: u64,
    selected: Option<usize>,
}

impl CacheStatusTable {
    pub fn new(frame_count: usize) -> Self {
        Self {
            frames: vec![SmallVec::new(); frame_count],
            generation: 0,
            selected: None,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Records that `coverage` (0.0..=1.0) of the requested extent at `level`
    /// has arrived. Returns the resulting status of that pair.
    pub fn mark_progress(&mut self, frame: usize, level: usize, coverage: f32) -> CacheStatus {
        let Some(levels) = self.frames.get_mut(frame) else {
            log::warn!("Progress for unknown frame {} ignored", frame);
            return CacheStatus::Empty;
        };
        if levels.len() <= level {
            levels.resize(level + 1, LevelEntry::default());
        }

        let entry = &mut levels[level];
        if coverage.is_nan() || coverage <= entry.coverage {
            return entry.status;
        }
        entry.coverage = coverage.min(1.0);

        let next = if entry.coverage >= 1.0 {
            CacheStatus::Complete
        } else if entry.coverage > 0.0 {
            CacheStatus::Partial
        } else {
            CacheStatus::Empty
        };
        if next > entry.status {
            log::debug!("Frame {} level {}: {:?} -> {:?}", frame, level, entry.status, next);
            entry.status = next;
        }
        entry.status
    }

    /// Sets the level the display currently asks for.
    pub fn select_level(&mut self, level: usize) {
        self.selected = Some(level);
    }

    pub fn selected_level(&self) -> Option<usize> {
        self.selected
    }

    /// Status of `frame` at the selected level. Before any level is selected
    /// this is [`CacheStatusTable::best_status`].
    pub fn status(&self, frame: usize) -> CacheStatus {
        match self.selected {
            Some(level) => self.status_at(frame, level),
            None => self.best_status(frame),
        }
    }

    /// Best status over all levels: whether anything at all can be shown.
    pub fn best_status(&self, frame: usize) -> CacheStatus {
        self.frames
            .get(frame)
            .and_then(|levels| levels.iter().map(|e| e.status).max())
            .unwrap_or_default()
    }

    pub fn status_at(&self, frame: usize, level: usize) -> CacheStatus {
        self.frames
            .get(frame)
            .and_then(|levels| levels.get(level))
            .map(|e| e.status)
            .unwrap_or_default()
    }

    /// Finest level of `frame` with anything decoded, if any.
    pub fn best_level(&self, frame: usize) -> Option<usize> {
        self.frames
            .get(frame)?
            .iter()
            .rposition(|e| e.status > CacheStatus::Empty)
    }

    /// Starts a new request generation, demoting complete entries to partial.
    pub fn begin_generation(&mut self) -> u64 {
        self.generation += 1;
        for entry in self.frames.iter_mut().flat_map(|levels| levels.iter_mut()) {
            if entry.status == CacheStatus::Complete {
                entry.status = CacheStatus::Partial;
                entry.coverage = 0.0;
            }
        }
        self.generation
    }

    /// Length of the leading run of frames that have at least a partial tile.
    pub fn partially_cached_until(&self) -> usize {
        (0..self.frames.len())
            .take_while(|&f| self.best_status(f) >= CacheStatus::Partial)
            .count()
    }

    /// Immutable copy of the per-frame status at the selected level, for other
    /// threads.
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            generation: self.generation,
            statuses: (0..self.frames.len()).map(|f| self.status(f)).collect(),
        }
    }
}

/// Point-in-time copy of a [`CacheStatusTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub generation: u64,
    pub statuses: Vec<CacheStatus>,
}

impl CacheSnapshot {
    pub fn status(&self, frame: usize) -> CacheStatus {
        self.statuses.get(frame).copied().unwrap_or_default()
    }

    pub fn complete_count(&self) -> usize {
        self.statuses.iter().filter(|s| **s == CacheStatus::Complete).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_scenario() {
        let mut table = CacheStatusTable::new(10);
        assert_eq!(table.status(7), CacheStatus::Empty);

        assert_eq!(table.mark_progress(7, 2, 0.5), CacheStatus::Partial);
        assert_eq!(table.status(7), CacheStatus::Partial);

        assert_eq!(table.mark_progress(7, 2, 1.0), CacheStatus::Complete);
        assert_eq!(table.status(7), CacheStatus::Complete);
        assert_eq!(table.status_at(7, 2), CacheStatus::Complete);
        assert_eq!(table.status_at(7, 3), CacheStatus::Empty);
    }

    #[test]
    fn test_no_backward_transitions_within_generation() {
        let mut table = CacheStatusTable::new(2);
        table.mark_progress(0, 0, 1.0);
        assert_eq!(table.mark_progress(0, 0, 0.25), CacheStatus::Complete);
        assert_eq!(table.mark_progress(0, 0, 0.0), CacheStatus::Complete);
        assert_eq!(table.mark_progress(1, 0, 0.0), CacheStatus::Empty);
    }

    #[test]
    fn test_new_generation_revisits_partial() {
        let mut table = CacheStatusTable::new(3);
        table.mark_progress(1, 0, 1.0);
        table.mark_progress(1, 1, 0.4);

        assert_eq!(table.begin_generation(), 1);
        assert_eq!(table.status_at(1, 0), CacheStatus::Partial);
        assert_eq!(table.status_at(1, 1), CacheStatus::Partial);

        assert_eq!(table.mark_progress(1, 0, 0.3), CacheStatus::Partial);
        assert_eq!(table.mark_progress(1, 0, 1.0), CacheStatus::Complete);
    }

    #[test]
    fn test_partially_cached_until_and_snapshot() {
        let mut table = CacheStatusTable::new(5);
        table.mark_progress(0, 0, 1.0);
        table.mark_progress(1, 3, 0.1);
        table.mark_progress(3, 0, 1.0);
        assert_eq!(table.partially_cached_until(), 2);
        assert_eq!(table.best_level(1), Some(3));
        assert_eq!(table.best_level(2), None);

        let snap = table.snapshot();
        table.mark_progress(2, 0, 1.0);
        // The snapshot does not see later writes.
        assert_eq!(snap.status(2), CacheStatus::Empty);
        assert_eq!(snap.complete_count(), 2);
        assert_eq!(table.partially_cached_until(), 4);
    }

    #[test]
    fn test_complete_coarse_level_does_not_complete_selected_level() {
        let mut table = CacheStatusTable::new(2);
        table.mark_progress(0, 0, 1.0);
        table.mark_progress(0, 2, 0.5);
        assert_eq!(table.status(0), CacheStatus::Complete);

        table.select_level(2);
        assert_eq!(table.status(0), CacheStatus::Partial);
        assert_eq!(table.best_status(0), CacheStatus::Complete);
        assert_eq!(table.snapshot().status(0), CacheStatus::Partial);
        // Still showable, so it counts toward the cached prefix.
        assert_eq!(table.partially_cached_until(), 1);
    }

    #[test]
    fn test_unknown_frame_is_ignored() {
        let mut table = CacheStatusTable::new(1);
        assert_eq!(table.mark_progress(5, 0, 1.0), CacheStatus::Empty);
        assert_eq!(table.status(5), CacheStatus::Empty);
    }
}
