//! Animation stepping and time lookup over a frame series.

use crate::config::PlaybackSpeed;
use crate::metadata::FrameMetadata;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// What happens at the end of the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationMode {
    /// Wrap around to the first frame.
    #[default]
    Loop,
    /// Stay on the last frame.
    Stop,
    /// Reverse direction at either end.
    Swing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Direction {
    #[default]
    Forward,
    Backward,
}

/// Playback state between steps: the swing direction and, for timed
/// playback, the speed and when the shown frame was entered.
#[derive(Debug, Clone, Default)]
pub struct Playback {
    direction: Direction,
    speed: PlaybackSpeed,
    entered: Option<Instant>,
}

impl Playback {
    pub fn new(speed: PlaybackSpeed) -> Self {
        Self {
            speed,
            ..Default::default()
        }
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.speed
    }

    pub fn set_speed(&mut self, speed: PlaybackSpeed) {
        self.speed = speed;
    }

    /// Forgets when the current frame was entered; the next timed advance
    /// starts counting again.
    pub fn pause(&mut self) {
        self.entered = None;
    }

    /// The frame after `current` in a series of `count` frames, or `None` when
    /// playback should stop.
    pub fn next_frame(&mut self, mode: AnimationMode, current: usize, count: usize) -> Option<usize> {
        let (next, direction) = self.peek(mode, current, count)?;
        self.direction = direction;
        Some(next)
    }

    /// Timed variant of [`Playback::next_frame`]: returns the next frame once
    /// the current one has been shown long enough at the configured speed.
    ///
    /// Frames at or past `accessible` (a count) are never entered; playback
    /// holds until more of the series becomes available. The first call only
    /// starts the clock.
    pub fn advance(
        &mut self,
        mode: AnimationMode,
        frames: &[FrameMetadata],
        current: usize,
        accessible: Option<usize>,
        now: Instant,
    ) -> Option<usize> {
        let Some(entered) = self.entered else {
            self.entered = Some(now);
            return None;
        };
        let (next, direction) = self.peek(mode, current, frames.len())?;
        if accessible.is_some_and(|limit| next >= limit) {
            return None;
        }
        let current = current.min(frames.len() - 1);
        if now.saturating_duration_since(entered) < self.speed.interval(&frames[current], &frames[next]) {
            return None;
        }
        self.direction = direction;
        self.entered = Some(now);
        Some(next)
    }

    fn peek(&self, mode: AnimationMode, current: usize, count: usize) -> Option<(usize, Direction)> {
        if count == 0 {
            return None;
        }
        let last = count - 1;
        let current = current.min(last);
        let keep = self.direction;

        match mode {
            AnimationMode::Loop => Some((if current == last { 0 } else { current + 1 }, keep)),
            AnimationMode::Stop => (current < last).then_some((current + 1, keep)),
            AnimationMode::Swing => {
                if last == 0 {
                    return Some((0, keep));
                }
                Some(match self.direction {
                    Direction::Forward if current < last => (current + 1, Direction::Forward),
                    Direction::Forward => (current - 1, Direction::Backward),
                    Direction::Backward if current > 0 => (current - 1, Direction::Backward),
                    Direction::Backward => (current + 1, Direction::Forward),
                })
            }
        }
    }
}

/// Index of the frame closest in time to `time`. On a tie the earlier frame
/// wins.
pub fn nearest_frame(frames: &[FrameMetadata], time: DateTime<Utc>) -> Option<usize> {
    if frames.is_empty() {
        return None;
    }
    let after = frames.partition_point(|f| f.timestamp < time);
    if after == 0 {
        return Some(0);
    }
    if after == frames.len() {
        return Some(frames.len() - 1);
    }

    let before_gap = time - frames[after - 1].timestamp;
    let after_gap = frames[after].timestamp - time;
    Some(if after_gap < before_gap { after } else { after - 1 })
}

/// Displayed frames per second, measured over windows of at least one second.
#[derive(Debug, Clone, Default)]
pub struct FrameRateCounter {
    window_start: Option<Instant>,
    frames_in_window: u32,
    last_frame: Option<usize>,
    rate: f32,
}

impl FrameRateCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    /// Counts `frame` as displayed at `now`. Repeats of the same frame (finer
    /// passes of it) do not count.
    pub fn record(&mut self, frame: usize, now: Instant) {
        if self.last_frame == Some(frame) {
            return;
        }
        self.last_frame = Some(frame);

        let start = *self.window_start.get_or_insert(now);
        self.frames_in_window += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Self::WINDOW {
            self.rate = self.frames_in_window as f32 / elapsed.as_secs_f32();
            self.frames_in_window = 0;
            self.window_start = Some(now);
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}
