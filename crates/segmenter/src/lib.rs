//! Lap Segmenter: turns each session's frame stream into sealed laps.
//!
//! A session buffers frames for its current lap number and seals the buffer
//! when a higher lap number shows up. Lap 0 is the "not on a counted lap"
//! sentinel, so nothing is buffered until a nonzero lap number is seen.

use std::collections::HashMap;

use model::{CompletedLap, TelemetryFrame};
use tracing::{debug, info, warn};

/// Open accumulator for one session's current lap.
#[derive(Debug, Clone, PartialEq)]
pub struct LapBuffer {
    session_id: String,
    lap_number: u32,
    frames: Vec<TelemetryFrame>,
}

impl LapBuffer {
    fn new(session_id: &str) -> Self {
        Self { session_id: session_id.to_string(), lap_number: 0, frames: Vec::new() }
    }

    pub fn session_id(&self) -> &str { &self.session_id }
    pub fn lap_number(&self) -> u32 { self.lap_number }
    pub fn frames(&self) -> &[TelemetryFrame] { &self.frames }

    /// Feeds one frame. Returns the sealed lap when `frame` starts a new one.
    pub fn push(&mut self, frame: TelemetryFrame) -> Option<CompletedLap> {
        let lap = frame.lap_number;

        if self.lap_number == 0 {
            if lap > 0 {
                self.lap_number = lap;
                self.frames.push(frame);
            }
            return None;
        }

        if lap > self.lap_number {
            let frames = std::mem::take(&mut self.frames);
            let completed = CompletedLap::seal(self.session_id.clone(), self.lap_number, frames);
            self.lap_number = lap;
            self.frames.push(frame);
            return Some(completed);
        }

        if lap < self.lap_number {
            warn!(session = %self.session_id, current = self.lap_number, got = lap, "lap number went backwards, keeping current lap");
        }
        self.frames.push(frame);
        None
    }
}

/// Owns one [`LapBuffer`] per live session.
#[derive(Debug, Default)]
pub struct Segmenter {
    sessions: HashMap<String, LapBuffer>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lap 0 frames for a session with no buffer are dropped without
    /// opening one.
    pub fn push(&mut self, session_id: &str, frame: TelemetryFrame) -> Option<CompletedLap> {
        if frame.lap_number == 0 && !self.sessions.contains_key(session_id) {
            return None;
        }
        let buffer = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| LapBuffer::new(session_id));
        let completed = buffer.push(frame)?;
        info!(
            session = %session_id,
            lap = completed.lap_number(),
            frames = completed.frames().len(),
            duration_ms = completed.duration_ms(),
            "lap completed"
        );
        Some(completed)
    }

    pub fn buffer(&self, session_id: &str) -> Option<&LapBuffer> {
        self.sessions.get(session_id)
    }

    /// Destroys the session's buffer. The open lap is never emitted; it is
    /// handed back so the caller can log what was discarded.
    pub fn end_session(&mut self, session_id: &str) -> Option<LapBuffer> {
        let buffer = self.sessions.remove(session_id)?;
        debug!(session = %session_id, lap = buffer.lap_number, frames = buffer.frames.len(), "session ended, open lap discarded");
        Some(buffer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
