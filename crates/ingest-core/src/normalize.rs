//! Frame Normalizer: raw decoder fields to the canonical [`TelemetryFrame`].
//!
//! This is the only place values get clamped. A field the decoder could not
//! read falls back to the session's previous frame, or zero for the first one.

use std::collections::HashMap;
use std::sync::Arc;

use model::TelemetryFrame;

use crate::{ProcessClock, RawFields, RawSample, SourceKind};

/// Maps one sample into a canonical frame stamped with `received_at`.
pub fn normalize(
    raw: &RawFields,
    source: SourceKind,
    previous: Option<&TelemetryFrame>,
    received_at: i64,
) -> TelemetryFrame {
    let prev = previous.copied().unwrap_or_default();

    // Hybrid source reports completed laps; the frame carries the lap being driven.
    let lap_number = match source {
        SourceKind::AccHybrid => raw.lap_number.map(|completed| completed.saturating_add(1)),
        SourceKind::AssettoCorsa | SourceKind::Demo => raw.lap_number,
    };

    TelemetryFrame {
        received_at,
        speed: finite(raw.speed).map_or(prev.speed, |v| v.max(0.0)),
        throttle: finite(raw.throttle).map_or(prev.throttle, |v| v.clamp(0.0, 1.0)),
        brake: finite(raw.brake).map_or(prev.brake, |v| v.clamp(0.0, 1.0)),
        steering: finite(raw.steering).map_or(prev.steering, |v| v.clamp(-1.0, 1.0)),
        gear: raw.gear.unwrap_or(prev.gear),
        rpm: raw.rpm.map_or(prev.rpm, non_negative),
        normalized_position: finite(raw.normalized_position)
            .map_or(prev.normalized_position, |v| v.clamp(0.0, 1.0)),
        lap_number: lap_number.map_or(prev.lap_number, non_negative),
        lap_time_ms: raw.lap_time_ms.map_or(prev.lap_time_ms, non_negative),
        session_time: finite(raw.session_time).or(prev.session_time),
        session_type: raw.session_type.or(prev.session_type),
        track_position: raw.track_position.or(prev.track_position),
        delta: raw.delta.or(prev.delta),
    }
}

// NaN and infinities count as "not read".
fn finite(v: Option<f32>) -> Option<f32> {
    v.filter(|x| x.is_finite())
}

fn non_negative(v: i32) -> u32 {
    v.max(0) as u32
}

/// Stateful wrapper that remembers the last frame of every live session.
pub struct Normalizer {
    clock: Arc<ProcessClock>,
    last: HashMap<String, TelemetryFrame>,
}

impl Normalizer {
    pub fn new(clock: Arc<ProcessClock>) -> Self {
        Self { clock, last: HashMap::new() }
    }

    pub fn normalize(&mut self, sample: &RawSample) -> TelemetryFrame {
        let received_at = self.clock.now_ms();
        let frame = normalize(&sample.fields, sample.source, self.last.get(&sample.session_id), received_at);
        self.last.insert(sample.session_id.clone(), frame);
        frame
    }

    pub fn end_session(&mut self, session_id: &str) {
        self.last.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> RawFields {
        RawFields {
            speed: Some(120.0),
            throttle: Some(0.5),
            brake: Some(0.0),
            steering: Some(0.1),
            gear: Some(4),
            rpm: Some(6500),
            normalized_position: Some(0.25),
            lap_number: Some(2),
            lap_time_ms: Some(12_345),
            ..Default::default()
        }
    }

    #[test]
    fn clamps_out_of_range_inputs() {
        let raw = RawFields {
            throttle: Some(1.4),
            brake: Some(-0.2),
            steering: Some(-2.0),
            lap_time_ms: Some(-5),
            normalized_position: Some(1.7),
            speed: Some(-3.0),
            rpm: Some(-100),
            ..full()
        };
        let f = normalize(&raw, SourceKind::AssettoCorsa, None, 1);
        assert_eq!(f.throttle, 1.0);
        assert_eq!(f.brake, 0.0);
        assert_eq!(f.steering, -1.0);
        assert_eq!(f.lap_time_ms, 0);
        assert_eq!(f.normalized_position, 1.0);
        assert_eq!(f.speed, 0.0);
        assert_eq!(f.rpm, 0);
    }

    #[test]
    fn missing_fields_fall_back_to_previous_frame() {
        let prev = normalize(&full(), SourceKind::AssettoCorsa, None, 1);
        let partial = RawFields { speed: Some(80.0), lap_time_ms: Some(13_000), ..Default::default() };
        let f = normalize(&partial, SourceKind::AssettoCorsa, Some(&prev), 2);
        assert_eq!(f.speed, 80.0);
        assert_eq!(f.lap_time_ms, 13_000);
        assert_eq!(f.gear, 4);
        assert_eq!(f.rpm, 6500);
        assert_eq!(f.lap_number, 2);
        assert_eq!(f.received_at, 2);
    }

    #[test]
    fn missing_fields_without_history_are_zero() {
        let f = normalize(&RawFields::default(), SourceKind::AssettoCorsa, None, 9);
        assert_eq!(f, TelemetryFrame { received_at: 9, ..Default::default() });
    }

    #[test]
    fn nan_is_treated_as_missing() {
        let prev = normalize(&full(), SourceKind::AssettoCorsa, None, 1);
        let raw = RawFields { throttle: Some(f32::NAN), ..full() };
        let f = normalize(&raw, SourceKind::AssettoCorsa, Some(&prev), 2);
        assert_eq!(f.throttle, 0.5);
    }

    #[test]
    fn hybrid_lap_number_counts_completed_laps() {
        let raw = RawFields { lap_number: Some(0), ..full() };
        assert_eq!(normalize(&raw, SourceKind::AccHybrid, None, 0).lap_number, 1);
        assert_eq!(normalize(&raw, SourceKind::AssettoCorsa, None, 0).lap_number, 0);
    }

    #[test]
    fn normalizer_tracks_sessions_independently() {
        let mut n = Normalizer::new(Arc::new(ProcessClock::new()));
        let a = RawSample { session_id: "a".into(), source: SourceKind::AssettoCorsa, fields: full() };
        let b = RawSample {
            session_id: "b".into(),
            source: SourceKind::AssettoCorsa,
            fields: RawFields { speed: Some(10.0), ..Default::default() },
        };
        let fa = n.normalize(&a);
        let fb = n.normalize(&b);
        assert_eq!(fa.gear, 4);
        assert_eq!(fb.gear, 0);
        assert!(fb.received_at >= fa.received_at);
    }
}
