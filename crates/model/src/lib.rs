//! Canonical telemetry records shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};

/// One sampled instant of vehicle state, already clamped to its valid ranges.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    /// Milliseconds since the unix epoch, taken from the process clock.
    #[serde(rename = "timestamp")]
    pub received_at: i64,
    pub speed: f32,    // km/h
    pub throttle: f32, // 0..1
    pub brake: f32,    // 0..1
    pub steering: f32, // -1..1
    pub gear: i32,
    pub rpm: u32,
    pub normalized_position: f32,
    pub lap_number: u32,
    #[serde(rename = "lapTime")]
    pub lap_time_ms: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_time: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_position: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i32>,
}

/// A sealed lap. Frames are in receipt order and can no longer change.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedLap {
    session_id: String,
    lap_number: u32,
    duration_ms: u64,
    frames: Vec<TelemetryFrame>,
}

impl CompletedLap {
    /// Seals `frames` as lap `lap_number`.
    ///
    /// The duration is the larger of the last frame's in-game lap time and
    /// the wall-clock span between the first and last frame.
    pub fn seal(session_id: impl Into<String>, lap_number: u32, frames: Vec<TelemetryFrame>) -> Self {
        let duration_ms = lap_duration_ms(&frames);
        Self { session_id: session_id.into(), lap_number, duration_ms, frames }
    }

    pub fn session_id(&self) -> &str { &self.session_id }
    pub fn lap_number(&self) -> u32 { self.lap_number }
    pub fn duration_ms(&self) -> u64 { self.duration_ms }
    pub fn frames(&self) -> &[TelemetryFrame] { &self.frames }
}

fn lap_duration_ms(frames: &[TelemetryFrame]) -> u64 {
    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return 0;
    };
    let span = last.received_at.saturating_sub(first.received_at).max(0) as u64;
    span.max(u64::from(last.lap_time_ms))
}

/// Synthetic lap set played back by viewers in demo mode.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DemoDataset {
    pub description: String,
    pub track: String,
    pub car: String,
    pub frame_rate: u32,
    #[serde(default)]
    pub laps: Vec<DemoLap>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DemoLap {
    pub lap_number: u32,
    #[serde(rename = "lapTime")]
    pub lap_time_ms: u32,
    #[serde(default)]
    pub frames: Vec<TelemetryFrame>,
}

impl DemoDataset {
    /// All frames across all laps, in lap order.
    pub fn flatten(&self) -> Vec<TelemetryFrame> {
        self.laps.iter().flat_map(|l| l.frames.iter().copied()).collect()
    }

    pub fn frame_count(&self) -> usize {
        self.laps.iter().map(|l| l.frames.len()).sum()
    }
}
