//! ACC broadcasting protocol: outbound control messages and inbound parsing.
//!
//! Strings on the wire are a u16 little-endian byte length followed by UTF-8.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const PROTOCOL_VERSION: u8 = 4;

// Outbound
const REGISTER_COMMAND_APPLICATION: u8 = 1;
const UNREGISTER_COMMAND_APPLICATION: u8 = 9;
const REQUEST_ENTRY_LIST: u8 = 10;
const REQUEST_TRACK_DATA: u8 = 11;

// Inbound
const REGISTRATION_RESULT: u8 = 1;
const REALTIME_UPDATE: u8 = 2;
const REALTIME_CAR_UPDATE: u8 = 3;
const ENTRY_LIST: u8 = 4;
const TRACK_DATA: u8 = 5;
const ENTRY_LIST_CAR: u8 = 6;
const BROADCASTING_EVENT: u8 = 7;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty datagram")]
    Empty,
    #[error("message type {kind} truncated")]
    Truncated { kind: u8 },
    #[error("string field is not utf-8")]
    BadString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastMessage {
    RegistrationResult { connection_id: i32, success: bool, readonly: bool, error: String },
    RealtimeUpdate { session_type: u8, session_time: f32, focused_car_index: i32 },
    /// Only the car index is read; the rest of the payload is not used.
    RealtimeCarUpdate { car_index: u16 },
    EntryList,
    TrackData,
    EntryListCar,
    BroadcastingEvent,
}

pub fn register_packet(display_name: &str, connection_password: &str, update_interval_ms: i32, command_password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + display_name.len() + connection_password.len() + command_password.len());
    buf.push(REGISTER_COMMAND_APPLICATION);
    buf.push(PROTOCOL_VERSION);
    write_string(&mut buf, display_name);
    write_string(&mut buf, connection_password);
    let _ = buf.write_i32::<LittleEndian>(update_interval_ms);
    write_string(&mut buf, command_password);
    buf
}

pub fn unregister_packet(connection_id: i32) -> Vec<u8> {
    with_connection_id(UNREGISTER_COMMAND_APPLICATION, connection_id)
}

/// Periodic request that keeps the registration alive while streaming.
pub fn keepalive_packet(connection_id: i32) -> Vec<u8> {
    with_connection_id(REQUEST_ENTRY_LIST, connection_id)
}

pub fn track_data_request(connection_id: i32) -> Vec<u8> {
    with_connection_id(REQUEST_TRACK_DATA, connection_id)
}

fn with_connection_id(kind: u8, connection_id: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(kind);
    let _ = buf.write_i32::<LittleEndian>(connection_id);
    buf
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    let _ = buf.write_u16::<LittleEndian>(len as u16);
    buf.extend_from_slice(&bytes[..len]);
}

/// Parses one inbound datagram. Unknown message types yield `Ok(None)`.
pub fn parse_inbound(data: &[u8]) -> Result<Option<BroadcastMessage>, ParseError> {
    let (&kind, _) = data.split_first().ok_or(ParseError::Empty)?;
    let mut c = Cursor::new(&data[1..]);
    let truncated = |_| ParseError::Truncated { kind };

    let msg = match kind {
        REGISTRATION_RESULT => {
            let connection_id = c.read_i32::<LittleEndian>().map_err(truncated)?;
            let success = c.read_u8().map_err(truncated)? > 0;
            // Older servers stop after the success flag.
            let readonly = c.read_u8().map(|b| b == 0).unwrap_or(false);
            let error = read_string(&mut c).unwrap_or_default();
            BroadcastMessage::RegistrationResult { connection_id, success, readonly, error }
        }
        REALTIME_UPDATE => {
            let _event_index = c.read_u16::<LittleEndian>().map_err(truncated)?;
            let _session_index = c.read_u16::<LittleEndian>().map_err(truncated)?;
            let session_type = c.read_u8().map_err(truncated)?;
            let _phase = c.read_u8().map_err(truncated)?;
            let session_time = c.read_f32::<LittleEndian>().map_err(truncated)?;
            let _session_end_time = c.read_f32::<LittleEndian>().map_err(truncated)?;
            let focused_car_index = c.read_i32::<LittleEndian>().map_err(truncated)?;
            BroadcastMessage::RealtimeUpdate { session_type, session_time, focused_car_index }
        }
        REALTIME_CAR_UPDATE => {
            let car_index = c.read_u16::<LittleEndian>().map_err(truncated)?;
            BroadcastMessage::RealtimeCarUpdate { car_index }
        }
        ENTRY_LIST => BroadcastMessage::EntryList,
        TRACK_DATA => BroadcastMessage::TrackData,
        ENTRY_LIST_CAR => BroadcastMessage::EntryListCar,
        BROADCASTING_EVENT => BroadcastMessage::BroadcastingEvent,
        _ => return Ok(None),
    };
    Ok(Some(msg))
}

fn read_string(c: &mut Cursor<&[u8]>) -> Result<String, ParseError> {
    let len = c.read_u16::<LittleEndian>().map_err(|_| ParseError::BadString)? as usize;
    let mut bytes = vec![0u8; len];
    c.read_exact(&mut bytes).map_err(|_| ParseError::BadString)?;
    String::from_utf8(bytes).map_err(|_| ParseError::BadString)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn register_layout() {
        let p = register_packet("Sector", "asd", 100, "");
        let mut expected = vec![1u8, 4];
        expected.extend_from_slice(&6u16.to_le_bytes());
        expected.extend_from_slice(b"Sector");
        expected.extend_from_slice(&3u16.to_le_bytes());
        expected.extend_from_slice(b"asd");
        expected.extend_from_slice(&100i32.to_le_bytes());
        expected.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(p, expected);
    }

    #[test]
    fn connection_scoped_packets() {
        assert_eq!(unregister_packet(7), vec![9, 7, 0, 0, 0]);
        assert_eq!(keepalive_packet(7), vec![10, 7, 0, 0, 0]);
        assert_eq!(track_data_request(7), vec![11, 7, 0, 0, 0]);
    }

    #[test]
    fn parses_registration_result() -> TestResult {
        let mut d = vec![REGISTRATION_RESULT];
        d.extend_from_slice(&42i32.to_le_bytes());
        d.push(1);
        d.push(0);
        d.extend_from_slice(&0u16.to_le_bytes());
        let msg = parse_inbound(&d)?.ok_or("expected message")?;
        assert_eq!(
            msg,
            BroadcastMessage::RegistrationResult { connection_id: 42, success: true, readonly: true, error: String::new() }
        );
        Ok(())
    }

    #[test]
    fn parses_failed_registration_with_error() -> TestResult {
        let mut d = vec![REGISTRATION_RESULT];
        d.extend_from_slice(&(-1i32).to_le_bytes());
        d.extend_from_slice(&[0, 1]);
        d.extend_from_slice(&14u16.to_le_bytes());
        d.extend_from_slice(b"wrong password");
        match parse_inbound(&d)? {
            Some(BroadcastMessage::RegistrationResult { success: false, error, .. }) => assert_eq!(error, "wrong password"),
            other => return Err(format!("unexpected {other:?}").into()),
        }
        Ok(())
    }

    #[test]
    fn parses_realtime_update() -> TestResult {
        let mut d = vec![REALTIME_UPDATE];
        d.extend_from_slice(&1u16.to_le_bytes());
        d.extend_from_slice(&0u16.to_le_bytes());
        d.push(10); // race
        d.push(5);
        d.extend_from_slice(&123_456.0f32.to_le_bytes());
        d.extend_from_slice(&0.0f32.to_le_bytes());
        d.extend_from_slice(&3i32.to_le_bytes());
        let msg = parse_inbound(&d)?;
        assert_eq!(
            msg,
            Some(BroadcastMessage::RealtimeUpdate { session_type: 10, session_time: 123_456.0, focused_car_index: 3 })
        );
        Ok(())
    }

    #[test]
    fn unknown_types_are_ignored() -> TestResult {
        assert_eq!(parse_inbound(&[0xEE, 1, 2, 3])?, None);
        assert_eq!(parse_inbound(&[ENTRY_LIST])?, Some(BroadcastMessage::EntryList));
        Ok(())
    }

    #[test]
    fn truncated_and_empty_are_errors() {
        assert!(matches!(parse_inbound(&[]), Err(ParseError::Empty)));
        assert!(matches!(parse_inbound(&[REALTIME_CAR_UPDATE, 1]), Err(ParseError::Truncated { kind: 3 })));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = parse_inbound(&data);
        }
    }
}
