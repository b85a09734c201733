//! Shared-memory snapshots and the frame assembler that combines them.

use parking_lot::Mutex;
use sector_ingest_core::le::{read_f32_le, read_i32_le};
use sector_ingest_core::RawFields;
use tokio::time::{Duration, Instant};

/// Bytes of the physics page we need to read.
pub const PHYSICS_PAGE_LEN: usize = 32;
/// Bytes of the graphics page we need to read.
pub const GRAPHICS_PAGE_LEN: usize = 252;

/// Single-slot, last-write-wins cell. Readers always see the newest value
/// and when it was stored; older values are simply overwritten.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    slot: Mutex<Option<(T, Instant)>>,
}

impl<T: Copy> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self { slot: Mutex::new(None) }
    }
}

impl<T: Copy> SnapshotCell<T> {
    pub fn store(&self, value: T) {
        *self.slot.lock() = Some((value, Instant::now()));
    }

    pub fn latest(&self) -> Option<(T, Instant)> {
        *self.slot.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsSnapshot {
    pub packet_id: i32,
    pub gas: f32,
    pub brake: f32,
    pub gear: i32,
    pub rpm: i32,
    pub steer_angle: f32,
    pub speed_kmh: f32,
}

impl PhysicsSnapshot {
    pub fn parse(page: &[u8]) -> Option<Self> {
        Some(Self {
            packet_id: read_i32_le(page, 0)?,
            gas: read_f32_le(page, 4)?,
            brake: read_f32_le(page, 8)?,
            gear: read_i32_le(page, 16)?,
            rpm: read_i32_le(page, 20)?,
            steer_angle: read_f32_le(page, 24)?,
            speed_kmh: read_f32_le(page, 28)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphicsSnapshot {
    pub packet_id: i32,
    pub completed_laps: i32,
    pub current_time_ms: i32,
    pub normalized_position: f32,
}

impl GraphicsSnapshot {
    pub fn parse(page: &[u8]) -> Option<Self> {
        Some(Self {
            packet_id: read_i32_le(page, 0)?,
            completed_laps: read_i32_le(page, 132)?,
            current_time_ms: read_i32_le(page, 140)?,
            normalized_position: read_f32_le(page, 248)?,
        })
    }
}

/// The two cells written by the shared-memory poller.
#[derive(Debug, Default)]
pub struct Snapshots {
    pub physics: SnapshotCell<PhysicsSnapshot>,
    pub graphics: SnapshotCell<GraphicsSnapshot>,
}

/// Session context learned from REALTIME_UPDATE.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RealtimeContext {
    pub session_type: Option<i32>,
    pub session_time: Option<f32>,
    pub focused_car_index: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assembly {
    Frame(RawFields),
    /// At least one snapshot kind has never been seen.
    NotReady,
    Stale { age: Duration },
}

/// Combines the latest physics and graphics snapshot on each car-update trigger.
pub fn assemble(snapshots: &Snapshots, ctx: &RealtimeContext, max_age: Duration) -> Assembly {
    let (Some((physics, p_at)), Some((graphics, g_at))) = (snapshots.physics.latest(), snapshots.graphics.latest()) else {
        return Assembly::NotReady;
    };
    let age = p_at.min(g_at).elapsed();
    if age > max_age {
        return Assembly::Stale { age };
    }
    Assembly::Frame(RawFields {
        speed: Some(physics.speed_kmh),
        throttle: Some(physics.gas),
        brake: Some(physics.brake),
        steering: Some(physics.steer_angle),
        gear: Some(physics.gear),
        rpm: Some(physics.rpm),
        normalized_position: Some(graphics.normalized_position),
        lap_number: Some(graphics.completed_laps),
        lap_time_ms: Some(graphics.current_time_ms),
        session_time: ctx.session_time,
        session_type: ctx.session_type,
        track_position: None,
        delta: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physics() -> PhysicsSnapshot {
        PhysicsSnapshot { packet_id: 1, gas: 0.9, brake: 0.0, gear: 4, rpm: 7000, steer_angle: 0.05, speed_kmh: 201.0 }
    }

    fn graphics() -> GraphicsSnapshot {
        GraphicsSnapshot { packet_id: 1, completed_laps: 2, current_time_ms: 45_000, normalized_position: 0.6 }
    }

    #[test]
    fn parses_physics_page() {
        let mut page = vec![0u8; PHYSICS_PAGE_LEN];
        page[0..4].copy_from_slice(&9i32.to_le_bytes());
        page[4..8].copy_from_slice(&0.5f32.to_le_bytes());
        page[16..20].copy_from_slice(&3i32.to_le_bytes());
        page[20..24].copy_from_slice(&5400i32.to_le_bytes());
        page[28..32].copy_from_slice(&144.0f32.to_le_bytes());
        let p = PhysicsSnapshot::parse(&page);
        assert_eq!(p.map(|p| (p.packet_id, p.gas, p.gear, p.rpm, p.speed_kmh)), Some((9, 0.5, 3, 5400, 144.0)));
        assert!(PhysicsSnapshot::parse(&page[..31]).is_none());
    }

    #[test]
    fn parses_graphics_page() {
        let mut page = vec![0u8; GRAPHICS_PAGE_LEN];
        page[132..136].copy_from_slice(&4i32.to_le_bytes());
        page[140..144].copy_from_slice(&61_000i32.to_le_bytes());
        page[248..252].copy_from_slice(&0.25f32.to_le_bytes());
        let g = GraphicsSnapshot::parse(&page);
        assert_eq!(g.map(|g| (g.completed_laps, g.current_time_ms, g.normalized_position)), Some((4, 61_000, 0.25)));
        assert!(GraphicsSnapshot::parse(&page[..250]).is_none());
    }

    #[test]
    fn cell_keeps_only_the_latest_value() {
        let cell = SnapshotCell::default();
        assert!(cell.latest().is_none());
        cell.store(1);
        cell.store(2);
        assert_eq!(cell.latest().map(|(v, _)| v), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn needs_both_snapshots() {
        let s = Snapshots::default();
        let ctx = RealtimeContext::default();
        assert_eq!(assemble(&s, &ctx, Duration::from_millis(500)), Assembly::NotReady);
        s.physics.store(physics());
        assert_eq!(assemble(&s, &ctx, Duration::from_millis(500)), Assembly::NotReady);
        s.graphics.store(graphics());
        match assemble(&s, &ctx, Duration::from_millis(500)) {
            Assembly::Frame(f) => {
                assert_eq!(f.speed, Some(201.0));
                assert_eq!(f.lap_number, Some(2));
                assert_eq!(f.lap_time_ms, Some(45_000));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_not_assembled() {
        let s = Snapshots::default();
        s.physics.store(physics());
        s.graphics.store(graphics());
        tokio::time::advance(Duration::from_millis(600)).await;
        s.physics.store(physics());
        assert!(matches!(
            assemble(&s, &RealtimeContext::default(), Duration::from_millis(500)),
            Assembly::Stale { .. }
        ));
        s.graphics.store(graphics());
        assert!(matches!(
            assemble(&s, &RealtimeContext::default(), Duration::from_millis(500)),
            Assembly::Frame(_)
        ));
    }
}
