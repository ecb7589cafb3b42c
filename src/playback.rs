//! Playback scheduler
//!
//! Lays inbound speech segments end to end on the output timeline so they
//! play in arrival order without gaps or overlap, and tracks every segment
//! still in flight so a barge-in can silence all of them at once.
//!
//! ```text
//!   cursor ─────────────┐
//!   ├── seg 1 ──┤── seg 2 ──┤── seg 3 ──┤
//!   ^ now                               ^ next start = max(cursor, now)
//! ```

use crate::audio::OutputSink;
use crate::codec::AudioFrame;
use crate::error::DeviceError;
use std::collections::BTreeMap;
use std::fmt;

/// Cancellation handle for one scheduled segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

impl SegmentId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A segment placed on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSegment {
    pub id: SegmentId,
    /// Start offset on the output clock, in seconds
    pub start: f64,
    /// Length in seconds
    pub duration: f64,
}

impl PlaybackSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Gapless, strictly ordered scheduler over an [`OutputSink`]
pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    cursor: f64,
    active: BTreeMap<SegmentId, PlaybackSegment>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink,
            cursor: 0.0,
            active: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Schedule a decoded frame right after everything already queued
    ///
    /// If the output clock has moved past the cursor the segment starts
    /// now; it is never scheduled in the past. A sink failure drops the
    /// segment and leaves the timeline untouched.
    pub fn schedule(&mut self, frame: AudioFrame) -> Result<PlaybackSegment, DeviceError> {
        let id = SegmentId(self.next_id);
        self.next_id += 1;

        let start = self.next_start();
        let duration = frame.duration_secs();
        let waited = frame.produced_at().elapsed().unwrap_or_default();

        if let Err(e) = self.sink.start(id, frame, start) {
            tracing::warn!("Failed to start segment {}: {}", id, e);
            return Err(e);
        }

        let segment = PlaybackSegment {
            id,
            start,
            duration,
        };
        self.cursor = segment.end();
        self.active.insert(id, segment);

        tracing::trace!(
            "Scheduled segment {} at {:.3}s for {:.3}s, {} ms after decode ({} active)",
            id,
            start,
            duration,
            waited.as_millis(),
            self.active.len()
        );

        Ok(segment)
    }

    /// Mark a segment as finished; returns whether it was still active
    pub fn complete(&mut self, id: SegmentId) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed {
            tracing::trace!("Segment {} finished ({} active)", id, self.active.len());
        }
        removed
    }

    /// Stop everything in flight and rewind the cursor to the output clock
    ///
    /// Idempotent; a no-op on an empty set.
    pub fn flush(&mut self) {
        let count = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            self.sink.stop(id);
        }
        self.cursor = self.sink.now();

        if count > 0 {
            tracing::debug!("Flushed {} queued segment(s)", count);
        }
    }

    /// Where the next segment would begin
    pub fn next_start(&self) -> f64 {
        self.cursor.max(self.sink.now())
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Current position of the output clock
    pub fn clock(&self) -> f64 {
        self.sink.now()
    }

    /// Nothing scheduled or audible
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Release the output device
    ///
    /// Dropping the scheduler does the same, logging any failure.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.sink.close()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.sink.close() {
            tracing::warn!("Failed to release speaker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        now: f64,
        started: Vec<(SegmentId, f64)>,
        stopped: Vec<SegmentId>,
        fail_next: bool,
        closes: usize,
    }

    /// Sink with a hand-driven clock
    #[derive(Clone, Default)]
    struct FakeSink(Arc<Mutex<FakeState>>);

    impl FakeSink {
        fn set_now(&self, now: f64) {
            self.0.lock().unwrap().now = now;
        }
    }

    impl OutputSink for FakeSink {
        fn now(&self) -> f64 {
            self.0.lock().unwrap().now
        }

        fn start(&mut self, id: SegmentId, _frame: AudioFrame, at: f64) -> Result<(), DeviceError> {
            let mut state = self.0.lock().unwrap();
            if state.fail_next {
                state.fail_next = false;
                return Err(DeviceError::Playback("boom".into()));
            }
            state.started.push((id, at));
            Ok(())
        }

        fn stop(&mut self, id: SegmentId) {
            self.0.lock().unwrap().stopped.push(id);
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.0.lock().unwrap().closes += 1;
            Ok(())
        }
    }

    /// 24 kHz mono frame of the given length in seconds
    fn frame(secs: f64) -> AudioFrame {
        AudioFrame::new(vec![0; (secs * 24000.0) as usize], 24000, 1)
    }

    fn scheduler() -> (PlaybackScheduler, FakeSink) {
        let sink = FakeSink::default();
        (PlaybackScheduler::new(Box::new(sink.clone())), sink)
    }

    #[test]
    fn test_segments_are_back_to_back() {
        let (mut scheduler, _sink) = scheduler();

        let a = scheduler.schedule(frame(0.5)).unwrap();
        let b = scheduler.schedule(frame(0.25)).unwrap();
        let c = scheduler.schedule(frame(1.0)).unwrap();

        assert_eq!(a.start, 0.0);
        assert!((b.start - 0.5).abs() < 1e-9);
        assert!((c.start - 0.75).abs() < 1e-9);
        assert!((scheduler.cursor() - 1.75).abs() < 1e-9);
        assert_eq!(scheduler.active_len(), 3);
    }

    #[test]
    fn test_late_segment_starts_at_clock() {
        let (mut scheduler, sink) = scheduler();

        scheduler.schedule(frame(0.5)).unwrap();
        sink.set_now(2.0);
        let late = scheduler.schedule(frame(0.5)).unwrap();

        assert_eq!(late.start, 2.0);
        assert_eq!(scheduler.cursor(), 2.5);
    }

    #[test]
    fn test_no_overlap_for_non_decreasing_arrivals() {
        let (mut scheduler, sink) = scheduler();
        let arrivals = [0.0, 0.1, 0.1, 0.9, 1.0, 3.2, 3.25, 3.3];
        let lengths = [0.3, 0.2, 0.5, 0.1, 0.4, 0.05, 0.6, 0.2];

        let mut segments = Vec::new();
        for (at, len) in arrivals.iter().zip(lengths.iter()) {
            sink.set_now(*at);
            let segment = scheduler.schedule(frame(*len)).unwrap();
            assert!(segment.start >= *at, "scheduled in the past");
            segments.push(segment);
        }

        for pair in segments.windows(2) {
            assert!(
                pair[1].start >= pair[0].end() - 1e-9,
                "{:?} overlaps {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_complete_removes_from_active_set() {
        let (mut scheduler, _sink) = scheduler();
        let a = scheduler.schedule(frame(0.1)).unwrap();
        let b = scheduler.schedule(frame(0.1)).unwrap();

        assert!(scheduler.complete(a.id));
        assert!(!scheduler.complete(a.id));
        assert!(!scheduler.is_idle());
        assert!(scheduler.complete(b.id));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_flush_stops_everything_and_rewinds() {
        let (mut scheduler, sink) = scheduler();
        let a = scheduler.schedule(frame(0.5)).unwrap();
        let b = scheduler.schedule(frame(0.5)).unwrap();
        sink.set_now(0.3);

        scheduler.flush();

        assert!(scheduler.is_idle());
        assert_eq!(scheduler.cursor(), 0.3);
        assert_eq!(scheduler.cursor(), scheduler.clock());
        let stopped = sink.0.lock().unwrap().stopped.clone();
        assert_eq!(stopped, vec![a.id, b.id]);

        // The next segment starts now, not at the stale cursor
        let next = scheduler.schedule(frame(0.1)).unwrap();
        assert_eq!(next.start, 0.3);
    }

    #[test]
    fn test_flush_on_empty_set_is_a_noop() {
        let (mut scheduler, sink) = scheduler();
        scheduler.flush();
        scheduler.flush();
        assert!(scheduler.is_idle());
        assert!(sink.0.lock().unwrap().stopped.is_empty());
    }

    #[test]
    fn test_failed_start_is_dropped() {
        let (mut scheduler, sink) = scheduler();
        scheduler.schedule(frame(0.5)).unwrap();
        sink.0.lock().unwrap().fail_next = true;

        assert!(scheduler.schedule(frame(0.5)).is_err());
        assert_eq!(scheduler.active_len(), 1);
        assert_eq!(scheduler.cursor(), 0.5);

        let next = scheduler.schedule(frame(0.5)).unwrap();
        assert_eq!(next.start, 0.5);
    }

    #[test]
    fn test_completion_after_flush_is_ignored() {
        let (mut scheduler, _sink) = scheduler();
        let a = scheduler.schedule(frame(0.5)).unwrap();
        scheduler.flush();
        assert!(!scheduler.complete(a.id));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_dropping_scheduler_closes_sink() {
        let (scheduler, sink) = scheduler();
        drop(scheduler);
        assert_eq!(sink.0.lock().unwrap().closes, 1);
    }
}
