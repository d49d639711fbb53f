use super::{Handoff, HandoffKind, LayerStatus, Shared};
use crate::cache::Interval;
use crate::decoder::DecodedTile;
use crate::events::StreamEvent;
use crate::resolution::SubImageRequest;
use crate::source::ImageSource;
use crate::{Result, StreamError};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One decode the view wants, tagged with the generation it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadJob {
    pub request: SubImageRequest,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    Decode(ReadJob),
    Preload(Interval<DateTime<Utc>>),
}

struct MailboxState {
    latest: Option<ReadJob>,
    preloads: VecDeque<Interval<DateTime<Utc>>>,
    closed: bool,
}

/// Inbox of the reader thread.
///
/// Holds a single pending decode (a newer one replaces it) and a queue of
/// preload intervals served only while no decode is pending.
pub struct Mailbox {
    state: Mutex<MailboxState>,
    wake: Condvar,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                latest: None,
                preloads: VecDeque::new(),
                closed: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Replaces the pending decode. Returns the job it superseded.
    pub fn post(&self, job: ReadJob) -> Option<ReadJob> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let displaced = state.latest.replace(job);
        drop(state);
        self.wake.notify_all();
        displaced
    }

    pub fn preload(&self, interval: Interval<DateTime<Utc>>) {
        let mut state = self.state.lock();
        if state.closed || interval.is_empty() {
            return;
        }
        state.preloads.push_back(interval);
        drop(state);
        self.wake.notify_all();
    }

    /// Blocks until there is work. `None` once closed.
    pub fn next(&self) -> Option<Work> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(job) = state.latest.take() {
                return Some(Work::Decode(job));
            }
            if let Some(interval) = state.preloads.pop_front() {
                return Some(Work::Preload(interval));
            }
            self.wake.wait(&mut state);
        }
    }

    /// Sleeps for `timeout` unless a new decode arrives or the mailbox closes
    /// first. Returns true if interrupted.
    pub fn wait_superseded(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed || state.latest.is_some() {
                return true;
            }
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return state.closed || state.latest.is_some();
            }
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.latest = None;
        state.preloads.clear();
        drop(state);
        self.wake.notify_all();
    }
}

/// How a decode attempt ended.
enum Outcome {
    Complete,
    /// The source stopped before delivering full coverage.
    Partial(f32),
    /// Teardown began while the decode was running.
    Abandoned,
}

/// Body of the `<name>-reader` thread: sole owner of decode traffic to the
/// source.
pub struct Reader {
    shared: Arc<Shared>,
    source: Arc<dyn ImageSource>,
    /// Frames already reported through `DecodeFailed`.
    reported: HashSet<usize>,
}

impl Reader {
    pub(crate) fn new(shared: Arc<Shared>, source: Arc<dyn ImageSource>) -> Self {
        Self {
            shared,
            source,
            reported: HashSet::new(),
        }
    }

    pub fn run(mut self) {
        log::info!("{}: reader started", self.shared.name);
        while let Some(work) = self.shared.mailbox.next() {
            if self.shared.is_shutting_down() {
                break;
            }
            match work {
                Work::Decode(job) => self.decode_with_retry(job),
                Work::Preload(interval) => self.preload(interval),
            }
        }
        log::info!("{}: reader stopped", self.shared.name);
    }

    fn decode_with_retry(&mut self, job: ReadJob) {
        let retry = self.shared.config.retry.clone();
        let frame = job.request.frame;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.decode_once(&job) {
                Ok(Outcome::Complete) => {
                    self.shared.set_layer_status(LayerStatus::Ok);
                    return;
                }
                Ok(Outcome::Partial(coverage)) => {
                    log::debug!(
                        "{}: decode of frame {} ended at {:.0}% coverage",
                        self.shared.name,
                        frame,
                        coverage * 100.0
                    );
                    return;
                }
                Ok(Outcome::Abandoned) => return,
                Err(_) if self.shared.is_shutting_down() => return,
                Err(err) => err,
            };

            if err.is_transient() && attempt < retry.max_attempts {
                let delay = retry.backoff(attempt);
                log::warn!(
                    "{}: frame {} attempt {}/{} failed ({}), retrying in {:?}",
                    self.shared.name,
                    frame,
                    attempt,
                    retry.max_attempts,
                    err,
                    delay
                );
                if self.shared.mailbox.wait_superseded(delay) {
                    log::debug!("{}: retry of frame {} abandoned", self.shared.name, frame);
                    return;
                }
                continue;
            }

            self.report_failure(frame, err);
            return;
        }
    }

    fn decode_once(&self, job: &ReadJob) -> Result<Outcome> {
        let request = job.request;
        let (sender, receiver) = smol::channel::unbounded::<Result<DecodedTile>>();
        self.source.request_decode(
            &request,
            Box::new(move |result| {
                // Receiver gone means the reader is shutting down.
                let _ = sender.send_blocking(result);
            }),
        );

        let mut coverage = None;
        while let Ok(result) = receiver.recv_blocking() {
            let tile = result?;
            if self.shared.is_shutting_down() {
                return Ok(Outcome::Abandoned);
            }

            let complete = tile.is_complete();
            let status = self
                .shared
                .status
                .write()
                .mark_progress(request.frame, request.level, tile.coverage);
            log::debug!(
                "{}: frame {} level {} pass at {:.0}% ({:?}, {:?})",
                self.shared.name,
                request.frame,
                request.level,
                tile.coverage * 100.0,
                status,
                tile.decode_time
            );

            coverage = Some(tile.coverage);
            self.shared.hand_off(Handoff {
                tile: Arc::new(tile),
                generation: job.generation,
                sequence: self.shared.next_sequence(),
                kind: HandoffKind::Exact,
            });

            if complete {
                return Ok(Outcome::Complete);
            }
        }

        if self.shared.is_shutting_down() {
            return Ok(Outcome::Abandoned);
        }
        match coverage {
            Some(coverage) => Ok(Outcome::Partial(coverage)),
            None => Err(StreamError::Decode {
                frame: request.frame,
                reason: "source finished without delivering a tile".into(),
            }),
        }
    }

    fn report_failure(&mut self, frame: usize, err: StreamError) {
        match err {
            StreamError::Decode { frame, reason } => {
                log::error!("{}: frame {} is malformed: {}", self.shared.name, frame, reason);
                self.shared
                    .set_layer_status(LayerStatus::Degraded(format!("frame {} could not be decoded", frame)));
                if self.reported.insert(frame) {
                    self.shared.events.emit(StreamEvent::DecodeFailed { frame, reason });
                }
            }
            err => {
                log::error!("{}: giving up on frame {}: {}", self.shared.name, frame, err);
                self.shared
                    .set_layer_status(LayerStatus::Degraded(format!("frame {} unavailable", frame)));
                self.shared.events.emit(StreamEvent::FrameUnavailable {
                    frame,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn preload(&self, interval: Interval<DateTime<Utc>>) {
        let fresh = self.shared.requests.lock().adapt(interval.start, interval.end);
        if fresh.is_empty() {
            log::debug!("{}: preload {} .. {} already requested", self.shared.name, interval.start, interval.end);
            return;
        }

        for part in fresh {
            match self.source.prefetch(&part) {
                Ok(count) => log::info!(
                    "{}: prefetched {} frames for {} .. {}",
                    self.shared.name,
                    count,
                    part.start,
                    part.end
                ),
                Err(e) => log::warn!("{}: prefetch of {} .. {} failed: {}", self.shared.name, part.start, part.end, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::metadata::testing::frame;
    use crate::resolution::{ResolutionSet, SubImage};
    use crate::source::testing::{FakeSource, Script};
    use std::thread;

    fn shared_with(config: StreamConfig, frames: usize) -> Arc<Shared> {
        let levels = Arc::new(ResolutionSet::dyadic(64, 64, 3).unwrap());
        let metas: Vec<_> = (0..frames).map(|i| frame(i, i as u32, 64)).collect();
        Arc::new(Shared::new("test".into(), config, metas.into(), vec![levels; frames]))
    }

    fn fast_retry(max_attempts: u32) -> StreamConfig {
        let mut config = StreamConfig::default();
        config.retry.max_attempts = max_attempts;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config
    }

    fn job(frame: usize, level: usize, generation: u64) -> ReadJob {
        ReadJob {
            request: SubImageRequest {
                frame,
                level,
                sub_image: SubImage::new(0, 0, 16, 16),
            },
            generation,
        }
    }

    fn source(frames: usize) -> Arc<FakeSource> {
        let metas = (0..frames).map(|i| frame(i, i as u32, 64)).collect();
        Arc::new(FakeSource::new(metas, ResolutionSet::dyadic(64, 64, 3).unwrap()))
    }

    #[test]
    fn test_mailbox_keeps_latest_and_prioritizes_decodes() {
        let mailbox = Mailbox::new();
        let day = Interval::new(frame(0, 0, 1).timestamp, frame(0, 30, 1).timestamp);
        mailbox.preload(day);
        assert_eq!(mailbox.post(job(1, 0, 1)), None);
        assert_eq!(mailbox.post(job(2, 0, 2)), Some(job(1, 0, 1)));

        assert_eq!(mailbox.next(), Some(Work::Decode(job(2, 0, 2))));
        assert_eq!(mailbox.next(), Some(Work::Preload(day)));
        mailbox.close();
        assert_eq!(mailbox.next(), None);
    }

    #[test]
    fn test_wait_superseded() {
        let mailbox = Arc::new(Mailbox::new());
        assert!(!mailbox.wait_superseded(Duration::from_millis(5)));

        let poster = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mailbox.post(job(0, 0, 9));
            })
        };
        let start = Instant::now();
        assert!(mailbox.wait_superseded(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        poster.join().unwrap();
    }

    #[test]
    fn test_progressive_passes_are_handed_off_in_order() {
        let shared = shared_with(StreamConfig::default(), 4);
        let source = source(4);
        source.script(Script::Passes(vec![0.25, 0.5, 1.0]));
        let mut reader = Reader::new(shared.clone(), source.clone());

        reader.decode_with_retry(job(3, 1, 7));

        // The slot kept only the final pass.
        let handoff = shared.handoff.try_take().unwrap();
        assert_eq!(handoff.generation, 7);
        assert_eq!(handoff.sequence, 3);
        assert!(handoff.tile.is_complete());
        assert_eq!(shared.status.read().status(3), crate::cache::CacheStatus::Complete);
    }

    #[test]
    fn test_transient_failures_retry_then_report_unavailable() {
        let shared = shared_with(fast_retry(3), 2);
        let events = shared.events.subscribe();
        let source = source(2);
        for _ in 0..3 {
            source.script(Script::Fail(StreamError::Network("reset".into())));
        }
        let mut reader = Reader::new(shared.clone(), source.clone());

        reader.decode_with_retry(job(1, 0, 1));

        assert_eq!(source.requests().len(), 3);
        assert!(matches!(
            events.events.try_recv(),
            Ok(StreamEvent::FrameUnavailable { frame: 1, .. })
        ));
        assert!(matches!(*shared.layer_status.lock(), LayerStatus::Degraded(_)));
        assert_eq!(shared.status.read().status(1), crate::cache::CacheStatus::Empty);
        assert!(shared.handoff.try_take().is_none());
    }

    #[test]
    fn test_retry_recovers() {
        let shared = shared_with(fast_retry(4), 2);
        let source = source(2);
        source.script(Script::Fail(StreamError::ServerBusy {
            status: 503,
            url: "http://x".into(),
        }));
        let mut reader = Reader::new(shared.clone(), source.clone());

        reader.decode_with_retry(job(0, 2, 1));
        assert_eq!(source.requests().len(), 2);
        assert!(shared.handoff.try_take().unwrap().tile.is_complete());
        assert_eq!(*shared.layer_status.lock(), LayerStatus::Ok);
    }

    #[test]
    fn test_retry_abandoned_when_superseded() {
        let mut config = fast_retry(5);
        config.retry.initial_backoff_ms = 60_000;
        config.retry.max_backoff_ms = 60_000;
        let shared = shared_with(config, 2);
        let source = source(2);
        source.script(Script::Fail(StreamError::Network("reset".into())));
        shared.mailbox.post(job(1, 0, 2));
        let mut reader = Reader::new(shared.clone(), source.clone());

        let start = Instant::now();
        reader.decode_with_retry(job(0, 0, 1));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(source.requests().len(), 1);
        assert_eq!(shared.mailbox.next(), Some(Work::Decode(job(1, 0, 2))));
    }

    #[test]
    fn test_decode_failure_reported_once() {
        let shared = shared_with(StreamConfig::default(), 3);
        let events = shared.events.subscribe();
        let source = source(3);
        let bad = || StreamError::Decode {
            frame: 2,
            reason: "truncated".into(),
        };
        source.script(Script::Fail(bad()));
        source.script(Script::Fail(bad()));
        let mut reader = Reader::new(shared.clone(), source.clone());

        reader.decode_with_retry(job(2, 0, 1));
        reader.decode_with_retry(job(2, 0, 2));

        // Malformed data is not retried.
        assert_eq!(source.requests().len(), 2);
        let received: Vec<_> = std::iter::from_fn(|| events.events.try_recv().ok()).collect();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], StreamEvent::DecodeFailed { frame: 2, .. }));
    }

    #[test]
    fn test_decode_cut_short_by_teardown_is_not_reported() {
        let shared = shared_with(fast_retry(3), 2);
        let events = shared.events.subscribe();
        let source = source(2);
        // A closing source ends the decode without delivering anything.
        source.script(Script::Passes(Vec::new()));
        shared.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut reader = Reader::new(shared.clone(), source.clone());

        reader.decode_with_retry(job(0, 0, 1));

        assert_eq!(source.requests().len(), 1);
        assert!(events.events.try_recv().is_err());
        assert_eq!(*shared.layer_status.lock(), LayerStatus::Ok);
    }

    #[test]
    fn test_preload_prefetches_only_missing_intervals() {
        let shared = shared_with(StreamConfig::default(), 6);
        let source = source(6);
        let reader = Reader::new(shared.clone(), source.clone());
        let t = |i: usize| frame(0, i as u32, 1).timestamp;

        reader.preload(Interval::new(t(0), t(3)));
        reader.preload(Interval::new(t(0), t(3)));
        reader.preload(Interval::new(t(2), t(5)));

        assert_eq!(
            source.prefetched(),
            vec![Interval::new(t(0), t(3)), Interval::new(t(3), t(5))]
        );
        assert_eq!(shared.requests.lock().len(), 1);
    }

    #[test]
    fn test_run_exits_when_mailbox_closes() {
        let shared = shared_with(StreamConfig::default(), 2);
        let source = source(2);
        let reader = Reader::new(shared.clone(), source.clone());
        let handle = thread::spawn(move || reader.run());

        shared.mailbox.post(job(0, 0, 1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.requests().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shared.mailbox.close();
        handle.join().unwrap();
        assert_eq!(source.requests().len(), 1);
    }
}
