//! Protobuf messages for the viewer channel and the durable log.
//!
//! Hand-written prost derives; the field numbers are the wire contract with
//! existing viewers and must not be renumbered.

use model::{CompletedLap, TelemetryFrame};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    Connected = 1,
    Telemetry = 2,
    StartDemo = 3,
    StopDemo = 4,
    DemoComplete = 5,
    Ping = 6,
    Pong = 7,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TelemetryFrameMsg {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(float, tag = "2")]
    pub speed: f32,
    #[prost(float, tag = "3")]
    pub throttle: f32,
    #[prost(float, tag = "4")]
    pub brake: f32,
    #[prost(float, tag = "5")]
    pub steering: f32,
    #[prost(int32, tag = "6")]
    pub gear: i32,
    #[prost(int32, tag = "7")]
    pub rpm: i32,
    #[prost(float, tag = "8")]
    pub normalized_position: f32,
    #[prost(int32, tag = "9")]
    pub lap_number: i32,
    #[prost(int32, tag = "10")]
    pub lap_time: i32,
    #[prost(float, optional, tag = "11")]
    pub session_time: Option<f32>,
    #[prost(int32, optional, tag = "12")]
    pub session_type: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub track_position: Option<i32>,
    #[prost(int32, optional, tag = "14")]
    pub delta: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusMessage {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WebSocketMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub telemetry: Option<TelemetryFrameMsg>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<StatusMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LapData {
    #[prost(int32, tag = "1")]
    pub lap_number: i32,
    #[prost(message, repeated, tag = "2")]
    pub frames: Vec<TelemetryFrameMsg>,
    #[prost(string, tag = "3")]
    pub session_id: String,
    #[prost(uint64, tag = "4")]
    pub duration_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RecordKind {
    Frame = 0,
    Lap = 1,
}

/// One entry appended to the durable per-user log.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LogRecord {
    #[prost(string, tag = "1")]
    pub topic: String,
    /// Partition key; the session id keeps one session's records in order.
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(enumeration = "RecordKind", tag = "3")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

impl From<&TelemetryFrame> for TelemetryFrameMsg {
    fn from(f: &TelemetryFrame) -> Self {
        Self {
            timestamp: f.received_at,
            speed: f.speed,
            throttle: f.throttle,
            brake: f.brake,
            steering: f.steering,
            gear: f.gear,
            rpm: to_i32(f.rpm),
            normalized_position: f.normalized_position,
            lap_number: to_i32(f.lap_number),
            lap_time: to_i32(f.lap_time_ms),
            session_time: f.session_time,
            session_type: f.session_type,
            track_position: f.track_position,
            delta: f.delta,
        }
    }
}

impl From<&TelemetryFrameMsg> for TelemetryFrame {
    fn from(m: &TelemetryFrameMsg) -> Self {
        Self {
            received_at: m.timestamp,
            speed: m.speed,
            throttle: m.throttle,
            brake: m.brake,
            steering: m.steering,
            gear: m.gear,
            rpm: m.rpm.max(0) as u32,
            normalized_position: m.normalized_position,
            lap_number: m.lap_number.max(0) as u32,
            lap_time_ms: m.lap_time.max(0) as u32,
            session_time: m.session_time,
            session_type: m.session_type,
            track_position: m.track_position,
            delta: m.delta,
        }
    }
}

impl From<&CompletedLap> for LapData {
    fn from(lap: &CompletedLap) -> Self {
        Self {
            lap_number: to_i32(lap.lap_number()),
            frames: lap.frames().iter().map(TelemetryFrameMsg::from).collect(),
            session_id: lap.session_id().to_string(),
            duration_ms: lap.duration_ms(),
        }
    }
}
