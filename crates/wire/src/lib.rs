//! Viewer-facing wire envelope.
//!
//! Envelopes travel as compact protobuf by default, with a JSON fallback for
//! clients that lack a protobuf decoder.

use model::TelemetryFrame;
use prost::Message;
use serde::{Deserialize, Serialize};

pub mod proto;

use proto::{MessageType, StatusMessage, TelemetryFrameMsg, WebSocketMessage};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("protobuf: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type {0}")]
    UnknownType(i32),
    #[error("{0} message has no payload")]
    MissingPayload(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Every message exchanged with a viewer. The first four flow server to
/// client, the last three client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Connected { message: String, timestamp: i64 },
    Telemetry {
        #[serde(rename = "data")]
        frame: TelemetryFrame,
    },
    DemoComplete { message: String },
    Pong { timestamp: i64 },
    StartDemo,
    StopDemo,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl Envelope {
    pub fn kind(&self) -> MessageType {
        match self {
            Envelope::Connected { .. } => MessageType::Connected,
            Envelope::Telemetry { .. } => MessageType::Telemetry,
            Envelope::DemoComplete { .. } => MessageType::DemoComplete,
            Envelope::Pong { .. } => MessageType::Pong,
            Envelope::StartDemo => MessageType::StartDemo,
            Envelope::StopDemo => MessageType::StopDemo,
            Envelope::Ping { .. } => MessageType::Ping,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Protobuf,
    Json,
}

fn status(message: impl Into<String>, timestamp: i64) -> Option<StatusMessage> {
    Some(StatusMessage { message: message.into(), timestamp })
}

impl From<&Envelope> for WebSocketMessage {
    fn from(env: &Envelope) -> Self {
        let mut msg = WebSocketMessage { kind: env.kind() as i32, telemetry: None, status: None };
        match env {
            Envelope::Connected { message, timestamp } => msg.status = status(message.as_str(), *timestamp),
            Envelope::Telemetry { frame } => msg.telemetry = Some(TelemetryFrameMsg::from(frame)),
            Envelope::DemoComplete { message } => msg.status = status(message.as_str(), 0),
            Envelope::Pong { timestamp } => msg.status = status("", *timestamp),
            Envelope::Ping { timestamp: Some(ts) } => msg.status = status("", *ts),
            Envelope::Ping { timestamp: None } | Envelope::StartDemo | Envelope::StopDemo => {}
        }
        msg
    }
}

impl TryFrom<WebSocketMessage> for Envelope {
    type Error = WireError;

    fn try_from(msg: WebSocketMessage) -> Result<Self> {
        let kind = MessageType::try_from(msg.kind).map_err(|_| WireError::UnknownType(msg.kind))?;
        let need_status = |what| msg.status.clone().ok_or(WireError::MissingPayload(what));
        Ok(match kind {
            MessageType::Connected => {
                let s = need_status("connected")?;
                Envelope::Connected { message: s.message, timestamp: s.timestamp }
            }
            MessageType::Telemetry => {
                let t = msg.telemetry.as_ref().ok_or(WireError::MissingPayload("telemetry"))?;
                Envelope::Telemetry { frame: TelemetryFrame::from(t) }
            }
            MessageType::DemoComplete => Envelope::DemoComplete { message: need_status("demo_complete")?.message },
            MessageType::Pong => Envelope::Pong { timestamp: need_status("pong")?.timestamp },
            MessageType::Ping => Envelope::Ping { timestamp: msg.status.as_ref().map(|s| s.timestamp) },
            MessageType::StartDemo => Envelope::StartDemo,
            MessageType::StopDemo => Envelope::StopDemo,
            MessageType::Unknown => return Err(WireError::UnknownType(msg.kind)),
        })
    }
}

pub fn encode(env: &Envelope, encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Protobuf => Ok(WebSocketMessage::from(env).encode_to_vec()),
        Encoding::Json => Ok(serde_json::to_vec(env)?),
    }
}

pub fn decode_as(bytes: &[u8], encoding: Encoding) -> Result<Envelope> {
    if bytes.is_empty() {
        return Err(WireError::Empty);
    }
    match encoding {
        Encoding::Protobuf => Envelope::try_from(WebSocketMessage::decode(bytes)?),
        Encoding::Json => Ok(serde_json::from_slice(bytes)?),
    }
}

/// Guesses the encoding from the first byte: a protobuf message starts with
/// a field key whose low three bits are a wire type (0..=5) and whose upper
/// bits are a small field number (1..=15 fits in one byte).
///
/// Best effort only. Plenty of text also passes this test (`{` reads as
/// field 15, wire type 3), so callers that know the frame type, such as a
/// websocket text frame, should call [`decode_as`] instead.
pub fn sniff(bytes: &[u8]) -> Encoding {
    let Some(&first) = bytes.first() else {
        return Encoding::Json;
    };
    let wire_type = first & 0x07;
    let field_number = first >> 3;
    if bytes.len() >= 2 && wire_type <= 5 && (1..=15).contains(&field_number) {
        Encoding::Protobuf
    } else {
        Encoding::Json
    }
}

/// Decodes a message whose encoding is not known up front.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    decode_as(bytes, sniff(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn boundary_frames() -> Vec<TelemetryFrame> {
        let base = TelemetryFrame {
            received_at: 1_700_000_000_000,
            speed: 212.5,
            throttle: 0.5,
            brake: 0.25,
            steering: -0.125,
            gear: 3,
            rpm: 7450,
            normalized_position: 0.5,
            lap_number: 2,
            lap_time_ms: 45_678,
            ..Default::default()
        };
        vec![
            base,
            TelemetryFrame { throttle: 0.0, brake: 1.0, gear: 0, lap_time_ms: 0, ..base },
            TelemetryFrame { throttle: 1.0, brake: 0.0, steering: 1.0, lap_number: 0, rpm: 0, ..base },
            TelemetryFrame {
                session_time: Some(1234.5),
                session_type: Some(10),
                track_position: Some(0),
                delta: Some(-250),
                ..base
            },
        ]
    }

    fn all_variants() -> Vec<Envelope> {
        let mut v: Vec<Envelope> = boundary_frames().into_iter().map(|frame| Envelope::Telemetry { frame }).collect();
        v.extend([
            Envelope::Connected { message: "hello".into(), timestamp: 1 },
            Envelope::Connected { message: String::new(), timestamp: 0 },
            Envelope::DemoComplete { message: "Demo playback complete".into() },
            Envelope::Pong { timestamp: 0 },
            Envelope::Pong { timestamp: 1_700_000_000_123 },
            Envelope::StartDemo,
            Envelope::StopDemo,
            Envelope::Ping { timestamp: None },
            Envelope::Ping { timestamp: Some(0) },
        ]);
        v
    }

    #[test]
    fn every_variant_round_trips_in_both_encodings() -> TestResult {
        for env in all_variants() {
            for enc in [Encoding::Protobuf, Encoding::Json] {
                let bytes = encode(&env, enc)?;
                assert_eq!(decode_as(&bytes, enc)?, env, "{enc:?}");
            }
        }
        Ok(())
    }

    #[test]
    fn protobuf_output_sniffs_as_protobuf() -> TestResult {
        for env in all_variants() {
            let bytes = encode(&env, Encoding::Protobuf)?;
            assert_eq!(sniff(&bytes), Encoding::Protobuf);
            assert_eq!(decode(&bytes)?, env);
        }
        Ok(())
    }

    #[test]
    fn sniff_rules() {
        assert_eq!(sniff(&[]), Encoding::Json);
        assert_eq!(sniff(&[0x08]), Encoding::Json); // too short
        assert_eq!(sniff(&[0x08, 0x02]), Encoding::Protobuf);
        assert_eq!(sniff(&[0x06, 0x00]), Encoding::Json); // field 0
        assert_eq!(sniff(&[0x0E, 0x00]), Encoding::Json); // wire type 6
        assert_eq!(sniff(&[0x80, 0x01]), Encoding::Json); // field 16
    }

    #[test]
    fn json_uses_snake_case_tags() -> TestResult {
        let bytes = encode(&Envelope::DemoComplete { message: "done".into() }, Encoding::Json)?;
        let v: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert_eq!(v["type"], "demo_complete");
        assert_eq!(decode_as(br#"{"type":"start_demo"}"#, Encoding::Json)?, Envelope::StartDemo);
        assert_eq!(decode_as(br#"{"type":"ping"}"#, Encoding::Json)?, Envelope::Ping { timestamp: None });
        Ok(())
    }

    #[test]
    fn unknown_tags_are_errors_not_panics() {
        assert!(matches!(decode_as(br#"{"type":"reboot"}"#, Encoding::Json), Err(WireError::Json(_))));
        let unknown = WebSocketMessage { kind: 42, telemetry: None, status: None }.encode_to_vec();
        assert!(matches!(decode_as(&unknown, Encoding::Protobuf), Err(WireError::UnknownType(42))));
        let zero = WebSocketMessage { kind: 0, telemetry: None, status: None };
        assert!(matches!(Envelope::try_from(zero), Err(WireError::UnknownType(0))));
        assert!(matches!(decode_as(&[], Encoding::Json), Err(WireError::Empty)));
    }

    #[test]
    fn telemetry_without_payload_is_rejected() {
        let msg = WebSocketMessage { kind: MessageType::Telemetry as i32, telemetry: None, status: None };
        assert!(matches!(Envelope::try_from(msg), Err(WireError::MissingPayload("telemetry"))));
    }

    fn arb_frame() -> impl Strategy<Value = TelemetryFrame> {
        (
            any::<i64>(),
            0.0f32..400.0,
            0.0f32..=1.0,
            0.0f32..=1.0,
            -1.0f32..=1.0,
            -1i32..9,
            0u32..20_000,
            0.0f32..=1.0,
            0u32..500,
            0u32..10_000_000,
        )
            .prop_map(|(ts, speed, throttle, brake, steering, gear, rpm, pos, lap, lap_time)| TelemetryFrame {
                received_at: ts,
                speed,
                throttle,
                brake,
                steering,
                gear,
                rpm,
                normalized_position: pos,
                lap_number: lap,
                lap_time_ms: lap_time,
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn telemetry_round_trips(frame in arb_frame()) {
            let env = Envelope::Telemetry { frame };
            for enc in [Encoding::Protobuf, Encoding::Json] {
                let bytes = encode(&env, enc).map_err(|e| TestCaseError::fail(e.to_string()))?;
                let back = decode_as(&bytes, enc).map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(&back, &env);
            }
        }

        #[test]
        fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode(&data);
        }
    }
}
