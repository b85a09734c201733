//! Deterministic demo dataset: a few laps of a made-up circuit driven by a
//! simple longitudinal model, so throttle, brake, steering, gear and rpm
//! stay correlated the way real telemetry is.

use std::f64::consts::PI;

use model::{DemoDataset, DemoLap, TelemetryFrame};

pub const FRAME_RATE: u32 = 60;
pub const LAP_DURATIONS_MS: [u32; 3] = [30_000, 30_500, 31_000];

struct Segment {
    from: f64,
    to: f64,
    target_kmh: f64,
    curvature: f64,
}

const fn seg(from: f64, to: f64, target_kmh: f64, curvature: f64) -> Segment {
    Segment { from, to, target_kmh, curvature }
}

const TRACK_PROFILE: [Segment; 9] = [
    seg(0.00, 0.12, 235.0, 0.05),
    seg(0.12, 0.18, 95.0, 0.85),
    seg(0.18, 0.33, 210.0, -0.18),
    seg(0.33, 0.40, 125.0, -0.65),
    seg(0.40, 0.55, 205.0, 0.12),
    seg(0.55, 0.63, 80.0, 0.95),
    seg(0.63, 0.78, 190.0, -0.22),
    seg(0.78, 0.90, 145.0, 0.55),
    seg(0.90, 1.01, 220.0, -0.08),
];

const GEAR_RATIOS: [f64; 7] = [0.0, 14.2, 10.4, 7.7, 6.0, 5.0, 4.2];
const TOP_GEAR: i32 = 6;
const UPSHIFT_RPM: f64 = 8200.0;
const DOWNSHIFT_RPM: f64 = 2600.0;

fn segment_at(pos: f64) -> &'static Segment {
    TRACK_PROFILE
        .iter()
        .find(|s| pos >= s.from && pos < s.to)
        .unwrap_or(&TRACK_PROFILE[TRACK_PROFILE.len() - 1])
}

fn rpm_from_speed(kmh: f64, gear: i32) -> f64 {
    let ratio = usize::try_from(gear).ok().and_then(|g| GEAR_RATIOS.get(g)).copied().unwrap_or(GEAR_RATIOS[6]);
    (kmh * ratio * 7.4 + 1100.0).clamp(1200.0, 9200.0)
}

// Seeded by lap and frame index so every run produces the same laps.
fn jitter(lap_index: usize, i: usize) -> f64 {
    let x = (((lap_index + 1) * 997) as f64 + (i + 1) as f64 * 0.013).sin() * 10_000.0;
    x - x.floor()
}

/// Generates lap `lap_index` (zero based) lasting `duration_ms`.
pub fn generate_lap(lap_index: usize, duration_ms: u32) -> DemoLap {
    let total = (f64::from(duration_ms) / 1000.0 * f64::from(FRAME_RATE)).round() as usize;
    let variation = 1.0 + (lap_index as f64 - 1.0) * 0.012;
    let dt = 1.0 / f64::from(FRAME_RATE);

    let mut speed = 110.0 * variation;
    let mut gear = 3;
    let mut frames = Vec::with_capacity(total);

    for i in 0..total {
        let t = i as f64 / total as f64;
        let lap_time = i as f64 / f64::from(FRAME_RATE) * 1000.0;
        let seg = segment_at(t);

        let noise = (jitter(lap_index, i) - 0.5) * 0.08;
        let target = seg.target_kmh * variation * (1.0 + noise * 0.35);
        let curvature = seg.curvature * (1.0 + noise * 0.2);
        let error = target - speed;

        let mut throttle = (error / 55.0).clamp(0.0, 1.0);
        let mut brake = (-error / 40.0).clamp(0.0, 1.0);

        let corner_lift = (curvature.abs() - 0.35).clamp(0.0, 1.0);
        throttle = (throttle * (1.0 - 0.55 * corner_lift)).clamp(0.0, 1.0);
        if brake > 0.08 {
            throttle = throttle.min(0.05);
        }

        let speed_norm = (speed / 240.0).clamp(0.0, 1.0);
        let steering = (curvature * (1.0 - 0.55 * speed_norm) + noise * 0.08).clamp(-1.0, 1.0);

        let accel = 30.0 * throttle;
        let decel = 55.0 * brake;
        let aero = 0.028 * speed * speed / 100.0;
        let corner_drag = 10.0 * steering.abs() * speed_norm;
        speed = (speed + (accel - decel - aero - corner_drag) * dt).clamp(35.0, 260.0);

        let mut rpm = rpm_from_speed(speed, gear);
        if throttle > 0.55 && rpm > UPSHIFT_RPM && gear < TOP_GEAR {
            gear += 1;
            rpm = rpm_from_speed(speed, gear);
        }
        if brake > 0.25 && rpm < DOWNSHIFT_RPM && gear > 1 {
            gear -= 1;
            rpm = rpm_from_speed(speed, gear);
        }

        // Small pedal oscillation so traces do not look machine flat.
        if throttle > 0.2 && brake < 0.05 {
            throttle = (throttle + (t * PI * 18.0).sin() * 0.035 + noise * 0.02).clamp(0.0, 1.0);
        }
        if brake > 0.15 {
            brake = (brake + (t * PI * 14.0).sin() * 0.04 + noise * 0.02).clamp(0.0, 1.0);
        }

        frames.push(TelemetryFrame {
            received_at: 0,
            speed: speed as f32,
            throttle: throttle as f32,
            brake: brake as f32,
            steering: steering as f32,
            gear,
            rpm: rpm.round() as u32,
            normalized_position: t as f32,
            lap_number: lap_index as u32 + 1,
            lap_time_ms: lap_time.round() as u32,
            ..Default::default()
        });
    }

    DemoLap { lap_number: lap_index as u32 + 1, lap_time_ms: duration_ms, frames }
}

/// The standard three-lap dataset.
pub fn generate() -> DemoDataset {
    DemoDataset {
        description: "Generated demo telemetry, correlated physics model (~30 s laps)".into(),
        track: "Demo Circuit".into(),
        car: "Demo Car".into(),
        frame_rate: FRAME_RATE,
        laps: LAP_DURATIONS_MS.iter().enumerate().map(|(idx, &dur)| generate_lap(idx, dur)).collect(),
    }
}
