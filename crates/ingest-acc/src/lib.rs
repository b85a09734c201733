//! Hybrid decoder for Assetto Corsa Competizione.
//!
//! The broadcasting UDP channel says *when* to emit a frame (each
//! REALTIME_CAR_UPDATE for the focused car); the shared-memory physics and
//! graphics pages say *what* goes in it.

use std::sync::Arc;

use anyhow::Context;
use sector_ingest_core::*;
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace, warn};

pub mod broadcast;
pub mod shm;
pub mod snapshot;

use broadcast::{parse_inbound, BroadcastMessage};
use snapshot::{assemble, Assembly, RealtimeContext, Snapshots};

#[derive(Clone, Debug)]
pub struct AccConfig {
    /// Local bind address; port 0 lets the OS choose
    pub listen: String,
    /// The game's broadcasting endpoint, e.g. "127.0.0.1:9000"
    pub broadcast: String,
    pub display_name: String,
    pub connection_password: String,
    pub command_password: String,
    /// Cadence we ask the game to broadcast at
    pub update_interval: Duration,
    pub keepalive_interval: Duration,
    pub registration_retry: Duration,
    /// Snapshots older than this are not assembled into frames
    pub snapshot_max_age: Duration,
    pub shared_memory_poll: Duration,
    pub max_datagram: usize,
}

impl Default for AccConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:0".into(),
            broadcast: "127.0.0.1:9000".into(),
            display_name: "Sector".into(),
            connection_password: "asd".into(),
            command_password: String::new(),
            update_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
            registration_retry: Duration::from_secs(5),
            snapshot_max_age: Duration::from_millis(500),
            shared_memory_poll: Duration::from_millis(16),
            max_datagram: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered { connection_id: i32 },
}

/// What the I/O loop should do after one inbound datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Registered { connection_id: i32 },
    Emit(RawFields),
    Nothing,
}

/// Per-instance protocol state, free of I/O so it can be driven from tests.
#[derive(Debug)]
pub struct AccDecoder {
    registration: Registration,
    realtime: RealtimeContext,
    snapshots: Arc<Snapshots>,
    max_age: Duration,
}

impl AccDecoder {
    pub fn new(snapshots: Arc<Snapshots>, max_age: Duration) -> Self {
        Self { registration: Registration::Unregistered, realtime: RealtimeContext::default(), snapshots, max_age }
    }

    pub fn registration(&self) -> Registration {
        self.registration
    }

    pub fn on_datagram(&mut self, data: &[u8]) -> Step {
        let msg = match parse_inbound(data) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                trace!(kind = data.first().copied(), "ignoring unhandled broadcast message");
                return Step::Nothing;
            }
            Err(e) => {
                debug!(error = %e, "malformed broadcast message");
                return Step::Nothing;
            }
        };

        match msg {
            BroadcastMessage::RegistrationResult { connection_id, success: true, readonly, .. } => {
                info!(connection_id, readonly, "registered with acc broadcasting");
                self.registration = Registration::Registered { connection_id };
                Step::Registered { connection_id }
            }
            BroadcastMessage::RegistrationResult { error, .. } => {
                error!(reason = %error, "acc rejected registration");
                Step::Nothing
            }
            BroadcastMessage::RealtimeUpdate { session_type, session_time, focused_car_index } => {
                self.realtime = RealtimeContext {
                    session_type: Some(i32::from(session_type)),
                    session_time: Some(session_time),
                    focused_car_index: Some(focused_car_index),
                };
                Step::Nothing
            }
            BroadcastMessage::RealtimeCarUpdate { car_index } => {
                if let Some(focused) = self.realtime.focused_car_index {
                    if i32::from(car_index) != focused {
                        return Step::Nothing;
                    }
                }
                match assemble(&self.snapshots, &self.realtime, self.max_age) {
                    Assembly::Frame(fields) => Step::Emit(fields),
                    Assembly::NotReady => {
                        trace!("car update before both snapshots arrived");
                        Step::Nothing
                    }
                    Assembly::Stale { age } => {
                        debug!(age_ms = age.as_millis() as u64, "skipping frame, shared memory snapshot is stale");
                        Step::Nothing
                    }
                }
            }
            BroadcastMessage::EntryList
            | BroadcastMessage::TrackData
            | BroadcastMessage::EntryListCar
            | BroadcastMessage::BroadcastingEvent => Step::Nothing,
        }
    }

    /// UNREGISTER for the current connection, if registered. Resets state either way.
    pub fn stop(&mut self) -> Option<Vec<u8>> {
        let packet = match self.registration {
            Registration::Registered { connection_id } => Some(broadcast::unregister_packet(connection_id)),
            Registration::Unregistered => None,
        };
        self.registration = Registration::Unregistered;
        packet
    }
}

pub struct AccSource {
    cfg: AccConfig,
    snapshots: Arc<Snapshots>,
}

impl AccSource {
    pub fn new(cfg: AccConfig) -> Self {
        Self { cfg, snapshots: Arc::new(Snapshots::default()) }
    }

    /// Cells the shared-memory poller writes into. Exposed so another
    /// snapshot feed can stand in for it.
    pub fn snapshots(&self) -> Arc<Snapshots> {
        self.snapshots.clone()
    }

    fn register_packet(&self) -> Vec<u8> {
        broadcast::register_packet(
            &self.cfg.display_name,
            &self.cfg.connection_password,
            self.cfg.update_interval.as_millis().min(i32::MAX as u128) as i32,
            &self.cfg.command_password,
        )
    }
}

#[async_trait::async_trait]
impl TelemetrySource for AccSource {
    fn kind(&self) -> SourceKind {
        SourceKind::AccHybrid
    }

    async fn run(&mut self, tx: TelemetryTx, mut shutdown: Shutdown) -> Result<(), IngestError> {
        let socket = UdpSocket::bind(&self.cfg.listen)
            .await
            .with_context(|| format!("bind {}", self.cfg.listen))?;
        let target = lookup_host(self.cfg.broadcast.as_str())
            .await
            .with_context(|| format!("resolve {}", self.cfg.broadcast))?
            .next()
            .ok_or_else(|| IngestError::Msg(format!("no address for {}", self.cfg.broadcast)))?;

        let session_id = new_session_id(self.kind());
        info!(%target, display_name = %self.cfg.display_name, session = %session_id, "acc decoder started");

        let poller: Option<JoinHandle<()>> = shm::spawn_poller(self.snapshots.clone(), self.cfg.shared_memory_poll);
        let mut decoder = AccDecoder::new(self.snapshots.clone(), self.cfg.snapshot_max_age);

        let register = self.register_packet();
        let mut register_retry = time::interval(self.cfg.registration_retry);
        register_retry.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut keepalive = time::interval(self.cfg.keepalive_interval);
        keepalive.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let mut out = Forwarder::new(self.kind(), tx);
        let mut buf = vec![0u8; self.cfg.max_datagram];
        while !*shutdown.borrow() {
            let registered = decoder.registration();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = register_retry.tick(), if registered == Registration::Unregistered => {
                    debug!(%target, "sending register");
                    if let Err(e) = socket.send_to(&register, target).await {
                        warn!(error = %e, %target, "register send failed");
                    }
                }
                _ = keepalive.tick(), if registered != Registration::Unregistered => {
                    if let Registration::Registered { connection_id } = registered {
                        if let Err(e) = socket.send_to(&broadcast::keepalive_packet(connection_id), target).await {
                            debug!(error = %e, %target, "keepalive send failed");
                        }
                    }
                }
                res = socket.recv_from(&mut buf) => {
                    let (len, _from) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(error = %e, "recv failed");
                            continue;
                        }
                    };
                    match decoder.on_datagram(&buf[..len]) {
                        Step::Registered { connection_id } => {
                            if let Err(e) = socket.send_to(&broadcast::track_data_request(connection_id), target).await {
                                warn!(error = %e, %target, "track data request send failed");
                            }
                        }
                        Step::Emit(fields) => {
                            let sample = RawSample { session_id: session_id.clone(), source: self.kind(), fields };
                            if !out.send(SourceEvent::Sample(sample)) {
                                break;
                            }
                        }
                        Step::Nothing => {}
                    }
                }
            }
        }

        if let Some(unregister) = decoder.stop() {
            match socket.send_to(&unregister, target).await {
                Ok(_) => info!(%target, "unregistered from acc broadcasting"),
                Err(e) => warn!(error = %e, %target, "unregister send failed"),
            }
        }
        if let Some(poller) = poller {
            poller.abort();
        }
        drop(socket);
        out.send(SourceEvent::SessionEnded { session_id });
        if out.dropped() > 0 {
            warn!(dropped = out.dropped(), "samples dropped on a full pipeline channel");
        }
        Ok(())
    }
}
