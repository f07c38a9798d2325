//! Playback queue controller
//!
//! Keeps the ordered list of ready segments and the cursor of the next one
//! to hand to the playback engine. The pipeline appends from the receiver
//! task while end-of-track events and the idle poll dequeue from the
//! coordinator, so every operation runs under one lock.
//!
//! The queue remembers which segments the engine currently holds (the
//! audible one plus at most one in the "up next" slot). End-of-track events
//! for anything else are stale and ignored, so an idle-poll restart that
//! races a pending event cannot fill the slot twice.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::engine::PlaybackEngine;
use crate::cache::PayloadSegment;

#[derive(Debug, Default)]
struct QueueState {
    segments: Vec<PayloadSegment>,
    /// Index of the next segment to hand to the engine
    cursor: usize,
    /// Whether any segment has been started this session
    started: bool,
    /// Segments handed to the engine and not yet ended, audible one first
    in_engine: VecDeque<PathBuf>,
}

/// Audible track plus the one-deep slot
const ENGINE_CAPACITY: usize = 2;

/// Ordered segment queue feeding a playback engine
pub struct PlaybackQueue {
    engine: Arc<dyn PlaybackEngine>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for PlaybackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PlaybackQueue")
            .field("segments", &state.segments.len())
            .field("cursor", &state.cursor)
            .field("started", &state.started)
            .field("in_engine", &state.in_engine.len())
            .finish()
    }
}

impl PlaybackQueue {
    pub fn new(engine: Arc<dyn PlaybackEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Register a newly persisted segment
    ///
    /// The first segment of a session starts playback right away.
    pub fn on_segment_ready(&self, segment: PayloadSegment) {
        let mut state = self.state.lock();
        state.segments.push(segment);
        if !state.started {
            self.play_immediate(&mut state);
        }
    }

    /// Engine finished `path`: refill its queue slot if a segment is waiting
    pub fn on_track_ended(&self, path: &Path) {
        let mut state = self.state.lock();
        if state.in_engine.front().map(PathBuf::as_path) != Some(path) {
            debug!("Ignoring end of {:?}; not the audible segment", path);
            return;
        }
        state.in_engine.pop_front();
        self.queue_next(&mut state);
    }

    /// Restart playback if the engine went idle while segments are waiting
    pub fn poll_idle(&self) {
        let mut state = self.state.lock();
        if state.cursor < state.segments.len() && !self.engine.is_busy() {
            self.play_immediate(&mut state);
        }
    }

    /// Forget every segment (full session reset)
    pub fn reset(&self) {
        *self.state.lock() = QueueState::default();
    }

    pub fn has_started(&self) -> bool {
        self.state.lock().started
    }

    /// Number of registered segments
    pub fn len(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Segments not yet handed to the engine
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.segments.len() - state.cursor
    }

    fn play_immediate(&self, state: &mut QueueState) {
        let Some(segment) = state.segments.get(state.cursor) else {
            return;
        };

        let result = self
            .engine
            .load(&segment.location)
            .and_then(|_| self.engine.play_immediately());
        match result {
            Ok(()) => {
                info!("Playing segment {} ({:?})", segment.index, segment.location);
                // Whatever the engine held before is gone
                state.in_engine.clear();
                state.in_engine.push_back(segment.location.clone());
                state.cursor += 1;
                state.started = true;
                self.queue_next(state);
            }
            Err(e) => warn!("Failed to play segment {}: {}", segment.index, e),
        }
    }

    fn queue_next(&self, state: &mut QueueState) {
        if state.in_engine.len() >= ENGINE_CAPACITY {
            return;
        }
        let Some(segment) = state.segments.get(state.cursor) else {
            return;
        };

        match self.engine.queue_next(&segment.location) {
            Ok(()) => {
                info!("Queued segment {} ({:?})", segment.index, segment.location);
                state.in_engine.push_back(segment.location.clone());
                state.cursor += 1;
            }
            Err(e) => warn!("Failed to queue segment {}: {}", segment.index, e),
        }
    }
}
