//! Polls ACC's shared-memory pages into the snapshot cells.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::snapshot::Snapshots;

pub const PHYSICS_MAP: &str = "Local\\acpmf_physics";
pub const GRAPHICS_MAP: &str = "Local\\acpmf_graphics";

/// Starts the poller, or returns `None` where shared memory is unavailable.
pub fn spawn_poller(snapshots: Arc<Snapshots>, every: Duration) -> Option<JoinHandle<()>> {
    imp::spawn(snapshots, every)
}

#[cfg(windows)]
mod imp {
    use std::ffi::CString;
    use std::sync::Arc;

    use anyhow::{bail, Context};
    use tokio::task::JoinHandle;
    use tokio::time::{self, Duration};
    use tracing::{debug, info, warn};
    use windows::core::PCSTR;
    use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
    use windows::Win32::System::Memory::{
        MapViewOfFile, OpenFileMappingA, UnmapViewOfFile, FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS,
    };

    use super::{GRAPHICS_MAP, PHYSICS_MAP};
    use crate::snapshot::{GraphicsSnapshot, PhysicsSnapshot, Snapshots, GRAPHICS_PAGE_LEN, PHYSICS_PAGE_LEN};

    struct Mapping {
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        handle: HANDLE,
        len: usize,
    }

    // The view is read-only and only touched from the owning task.
    unsafe impl Send for Mapping {}

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                if !self.view.Value.is_null() {
                    let _ = UnmapViewOfFile(self.view);
                }
                if !self.handle.is_invalid() {
                    let _ = CloseHandle(self.handle);
                }
            }
        }
    }

    impl Mapping {
        fn open(name: &str, len: usize) -> anyhow::Result<Self> {
            let cname = CString::new(name).context("mapping name")?;
            unsafe {
                let handle = OpenFileMappingA(FILE_MAP_READ.0, BOOL(0), PCSTR(cname.as_ptr() as *const u8))
                    .with_context(|| format!("open {name}; is ACC running?"))?;
                let view = MapViewOfFile(handle, FILE_MAP_READ, 0, 0, len);
                if view.Value.is_null() {
                    let _ = CloseHandle(handle);
                    bail!("map view of {name}");
                }
                Ok(Self { view, handle, len })
            }
        }

        fn copy_into(&self, buf: &mut [u8]) {
            let n = self.len.min(buf.len());
            unsafe { std::ptr::copy_nonoverlapping(self.view.Value as *const u8, buf.as_mut_ptr(), n) }
        }
    }

    pub(super) fn spawn(snapshots: Arc<Snapshots>, every: Duration) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(async move {
            let mut tick = time::interval(every);
            tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            let mut maps: Option<(Mapping, Mapping)> = None;
            let mut physics_page = vec![0u8; PHYSICS_PAGE_LEN];
            let mut graphics_page = vec![0u8; GRAPHICS_PAGE_LEN];
            let (mut last_physics, mut last_graphics) = (None, None);
            loop {
                tick.tick().await;
                if maps.is_none() {
                    match Mapping::open(PHYSICS_MAP, PHYSICS_PAGE_LEN)
                        .and_then(|p| Ok((p, Mapping::open(GRAPHICS_MAP, GRAPHICS_PAGE_LEN)?)))
                    {
                        Ok(m) => {
                            info!("acc shared memory mapped");
                            maps = Some(m);
                        }
                        Err(e) => {
                            debug!(error = %e, "acc shared memory not available yet");
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                let Some((physics, graphics)) = maps.as_ref() else { continue };

                physics.copy_into(&mut physics_page);
                graphics.copy_into(&mut graphics_page);

                // Only fresh packets refresh a cell, so a paused game goes stale.
                match PhysicsSnapshot::parse(&physics_page) {
                    Some(p) if Some(p.packet_id) != last_physics => {
                        last_physics = Some(p.packet_id);
                        snapshots.physics.store(p);
                    }
                    Some(_) => {}
                    None => warn!("physics page too short"),
                }
                match GraphicsSnapshot::parse(&graphics_page) {
                    Some(g) if Some(g.packet_id) != last_graphics => {
                        last_graphics = Some(g.packet_id);
                        snapshots.graphics.store(g);
                    }
                    Some(_) => {}
                    None => warn!("graphics page too short"),
                }
            }
        }))
    }
}

#[cfg(not(windows))]
mod imp {
    use std::sync::Arc;

    use tokio::task::JoinHandle;
    use tokio::time::Duration;
    use tracing::warn;

    use crate::snapshot::Snapshots;

    pub(super) fn spawn(_snapshots: Arc<Snapshots>, _every: Duration) -> Option<JoinHandle<()>> {
        warn!("acc shared memory is only available on windows; frames need an external snapshot feed");
        None
    }
}
