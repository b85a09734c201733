//! Distribution Bridge: fans live frames out to viewers and runs per-viewer
//! demo playback.
//!
//! Each viewer owns a bounded [`OutboundQueue`]. Live delivery only ever
//! pushes into those queues, so a stalled viewer loses its own oldest
//! messages and never holds up anyone else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use model::{CompletedLap, TelemetryFrame};
use parking_lot::{Mutex, RwLock};
use publish::{FrameIntake, PublishError};
use sector_ingest_core::clock::unix_millis;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, trace};
use wire::{Encoding, Envelope};

pub mod queue;
pub mod server;

pub use queue::{OutboundQueue, Origin};

pub const CONNECTED_MESSAGE: &str = "Connected to Sector telemetry bridge";
pub const DEMO_COMPLETE_MESSAGE: &str = "Demo playback complete";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is shut down")]
    Closed,
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: String,
    pub demo_fps: u32,
    pub outbound_queue: usize,
    pub max_message_size: usize,
    /// Encoding for viewers until they send a text frame.
    pub encoding: Encoding,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            demo_fps: 30,
            outbound_queue: 256,
            max_message_size: 10 * 1024 * 1024,
            encoding: Encoding::Protobuf,
        }
    }
}

impl BridgeConfig {
    fn demo_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.demo_fps.max(1)))
    }
}

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Demo,
}

struct ConnState {
    mode: Mode,
    // Bumped whenever playback starts or stops; a playback task that sees
    // a different epoch has been cancelled.
    demo_epoch: u64,
    demo_task: Option<JoinHandle<()>>,
}

struct Connection {
    id: ConnectionId,
    queue: Arc<OutboundQueue>,
    state: Mutex<ConnState>,
}

impl Connection {
    fn cancel_demo(&self, st: &mut ConnState) {
        st.demo_epoch += 1;
        if let Some(task) = st.demo_task.take() {
            task.abort();
        }
        st.mode = Mode::Live;
        self.queue.purge(Origin::Demo);
    }
}

struct Inner {
    cfg: BridgeConfig,
    demo: Arc<[TelemetryFrame]>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// `demo` is shared read-only by every viewer that starts playback.
    pub fn new(cfg: BridgeConfig, demo: Vec<TelemetryFrame>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                demo: demo.into(),
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.cfg
    }

    /// Registers a viewer and queues its `connected` greeting.
    pub fn connect(&self) -> Result<Viewer, BridgeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection {
            id,
            queue: Arc::new(OutboundQueue::new(self.inner.cfg.outbound_queue)),
            state: Mutex::new(ConnState { mode: Mode::Live, demo_epoch: 0, demo_task: None }),
        });
        conn.queue.push(
            Origin::Control,
            Envelope::Connected { message: CONNECTED_MESSAGE.into(), timestamp: unix_millis() },
        );
        self.inner.connections.write().insert(id, conn.clone());
        info!(connection = id, viewers = self.connection_count(), "viewer connected");
        Ok(Viewer { id, queue: conn.queue.clone(), bridge: self.clone() })
    }

    /// Applies one client message to a connection. Server-bound variants
    /// are acted on; anything else is logged and ignored.
    pub fn handle(&self, id: ConnectionId, msg: Envelope) {
        let Some(conn) = self.inner.connections.read().get(&id).cloned() else {
            return;
        };
        match msg {
            Envelope::StartDemo => self.start_demo(&conn),
            Envelope::StopDemo => {
                conn.cancel_demo(&mut conn.state.lock());
                debug!(connection = id, "demo stopped");
            }
            Envelope::Ping { timestamp } => {
                conn.queue.push(Origin::Control, Envelope::Pong { timestamp: timestamp.unwrap_or_else(unix_millis) });
            }
            other => debug!(connection = id, kind = ?other.kind(), "ignoring client message"),
        }
    }

    fn start_demo(&self, conn: &Arc<Connection>) {
        let mut st = conn.state.lock();
        conn.cancel_demo(&mut st);

        if self.inner.demo.is_empty() {
            conn.queue.push(Origin::Control, Envelope::DemoComplete { message: DEMO_COMPLETE_MESSAGE.into() });
            return;
        }

        st.mode = Mode::Demo;
        let epoch = st.demo_epoch;
        let task = tokio::spawn(play_demo(conn.clone(), epoch, self.inner.demo.clone(), self.inner.cfg.demo_period()));
        st.demo_task = Some(task);
        info!(connection = conn.id, frames = self.inner.demo.len(), "demo started");
    }

    /// Pushes one live frame to every viewer in live mode.
    pub fn broadcast_frame(&self, frame: &TelemetryFrame) -> usize {
        let env = Envelope::Telemetry { frame: *frame };
        let conns = self.inner.connections.read();
        let mut sent = 0;
        for conn in conns.values() {
            if conn.state.lock().mode != Mode::Live {
                continue;
            }
            if conn.queue.push(Origin::Live, env.clone()) {
                sent += 1;
            }
        }
        trace!(viewers = sent, "live frame fanned out");
        sent
    }

    pub fn disconnect(&self, id: ConnectionId) {
        let Some(conn) = self.inner.connections.write().remove(&id) else {
            return;
        };
        conn.cancel_demo(&mut conn.state.lock());
        conn.queue.close();
        info!(connection = id, viewers = self.connection_count(), "viewer disconnected");
    }

    /// Closes every viewer and refuses new ones.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let ids: Vec<ConnectionId> = self.inner.connections.read().keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
        info!("bridge closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn mode(&self, id: ConnectionId) -> Option<Mode> {
        let conn = self.inner.connections.read().get(&id).cloned()?;
        let mode = conn.state.lock().mode;
        Some(mode)
    }
}

async fn play_demo(conn: Arc<Connection>, epoch: u64, frames: Arc<[TelemetryFrame]>, period: Duration) {
    let mut tick = time::interval(period);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    for frame in frames.iter() {
        tick.tick().await;
        let st = conn.state.lock();
        if st.demo_epoch != epoch {
            return;
        }
        let frame = TelemetryFrame { received_at: unix_millis(), ..*frame };
        conn.queue.push(Origin::Demo, Envelope::Telemetry { frame });
    }

    let mut st = conn.state.lock();
    if st.demo_epoch != epoch {
        return;
    }
    conn.queue.push(Origin::Control, Envelope::DemoComplete { message: DEMO_COMPLETE_MESSAGE.into() });
    st.mode = Mode::Live;
    st.demo_task = None;
    debug!(connection = conn.id, "demo finished");
}

impl FrameIntake for Bridge {
    fn accept_frame(&self, _session_id: &str, frame: &TelemetryFrame) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Rejected("bridge is shut down".into()));
        }
        self.broadcast_frame(frame);
        Ok(())
    }

    fn accept_lap(&self, lap: &CompletedLap) -> Result<(), PublishError> {
        debug!(session = %lap.session_id(), lap = lap.lap_number(), "lap completed");
        Ok(())
    }
}

/// Handle a transport holds for one connected viewer. Dropping it disconnects.
pub struct Viewer {
    id: ConnectionId,
    queue: Arc<OutboundQueue>,
    bridge: Bridge,
}

impl Viewer {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next outbound message, or `None` once the connection is closed.
    pub async fn recv(&self) -> Option<Envelope> {
        self.queue.recv().await
    }

    pub fn handle(&self, msg: Envelope) {
        self.bridge.handle(self.id, msg);
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.bridge.disconnect(self.id);
    }
}
