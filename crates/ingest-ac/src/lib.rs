//! Handshake-style UDP decoder for Assetto Corsa's remote telemetry stream.
//!
//! The game only streams after a subscribe exchange: we send INIT, the game
//! answers with a handshake response, we reply SUBSCRIBE_UPDATE, and from
//! then on every datagram is a car-info packet. DISMISS ends the stream.

use std::net::SocketAddr;

use anyhow::Context;
use sector_ingest_core::le::{read_f32_le, read_i32_le};
use sector_ingest_core::*;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{self, Duration};
use tracing::{debug, info, trace, warn};

/// Size of every outbound control datagram.
pub const CONTROL_LEN: usize = 12;
/// Anything shorter is not a telemetry packet.
pub const MIN_PACKET_LEN: usize = 44;

// Field offsets in the car-info packet (little endian).
const OFF_SPEED: usize = 8;
const OFF_LAP_TIME: usize = 40;
const OFF_LAP_NUMBER: usize = 52;
const OFF_THROTTLE: usize = 56;
const OFF_BRAKE: usize = 60;
const OFF_RPM: usize = 68;
const OFF_STEERING: usize = 72;
const OFF_GEAR: usize = 76;
const OFF_NORMALIZED_POSITION: usize = 308;

const IDENTIFIER: i32 = 0;
const VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Operation {
    Init = 0,
    SubscribeUpdate = 1,
    Dismiss = 3,
}

/// Builds the 12-byte `identifier, version, operation` control datagram.
pub fn control_datagram(op: Operation) -> [u8; CONTROL_LEN] {
    let mut buf = [0u8; CONTROL_LEN];
    buf[0..4].copy_from_slice(&IDENTIFIER.to_le_bytes());
    buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
    buf[8..12].copy_from_slice(&(op as i32).to_le_bytes());
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Uninitialized,
    HandshakeSent,
    Subscribed,
    Dismissed,
}

/// What the I/O loop should do with one inbound datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handshake response received; send `reply` to `to`.
    Subscribe { reply: [u8; CONTROL_LEN], to: SocketAddr },
    Telemetry(RawFields),
    /// Undersized packet, or traffic after DISMISS.
    Dropped,
}

/// Per-instance handshake state. Holds no socket, so it is driven by
/// [`AcSource`] in production and directly by tests.
#[derive(Debug)]
pub struct AcDecoder {
    state: HandshakeState,
    peer: Option<SocketAddr>,
}

impl Default for AcDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AcDecoder {
    pub fn new() -> Self {
        Self { state: HandshakeState::Uninitialized, peer: None }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Address that answered the handshake, once known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns the INIT datagram and moves to `HandshakeSent`.
    pub fn start(&mut self) -> [u8; CONTROL_LEN] {
        self.state = HandshakeState::HandshakeSent;
        control_datagram(Operation::Init)
    }

    pub fn on_datagram(&mut self, data: &[u8], from: SocketAddr) -> Inbound {
        match self.state {
            HandshakeState::Uninitialized | HandshakeState::HandshakeSent => {
                self.state = HandshakeState::Subscribed;
                self.peer = Some(from);
                Inbound::Subscribe { reply: control_datagram(Operation::SubscribeUpdate), to: from }
            }
            HandshakeState::Subscribed => match decode(data) {
                Some(fields) => Inbound::Telemetry(fields),
                None => Inbound::Dropped,
            },
            HandshakeState::Dismissed => Inbound::Dropped,
        }
    }

    /// Returns the DISMISS datagram unless already dismissed. The state moves
    /// to `Dismissed` whether or not the caller manages to send it.
    pub fn stop(&mut self) -> Option<[u8; CONTROL_LEN]> {
        if self.state == HandshakeState::Dismissed {
            return None;
        }
        self.state = HandshakeState::Dismissed;
        Some(control_datagram(Operation::Dismiss))
    }
}

/// Decodes one car-info packet. Packets shorter than [`MIN_PACKET_LEN`]
/// yield `None`; fields past the end of a short-but-valid packet are left
/// unset for the normalizer to fill in.
pub fn decode(data: &[u8]) -> Option<RawFields> {
    if data.len() < MIN_PACKET_LEN {
        return None;
    }
    Some(RawFields {
        speed: read_f32_le(data, OFF_SPEED),
        lap_time_ms: read_i32_le(data, OFF_LAP_TIME),
        lap_number: read_i32_le(data, OFF_LAP_NUMBER),
        throttle: read_f32_le(data, OFF_THROTTLE),
        brake: read_f32_le(data, OFF_BRAKE),
        rpm: read_i32_le(data, OFF_RPM),
        steering: read_f32_le(data, OFF_STEERING),
        gear: read_i32_le(data, OFF_GEAR),
        normalized_position: read_f32_le(data, OFF_NORMALIZED_POSITION),
        ..Default::default()
    })
}

#[derive(Clone, Debug)]
pub struct AcConfig {
    /// Local bind address, e.g. "0.0.0.0:9996"
    pub listen: String,
    /// Where the game listens for the handshake
    pub source: String,
    pub max_datagram: usize,
    /// INIT is re-sent at this cadence until the game answers
    pub handshake_retry: Duration,
}

impl Default for AcConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9996".into(),
            source: "127.0.0.1:9996".into(),
            max_datagram: 2048,
            handshake_retry: Duration::from_secs(2),
        }
    }
}

pub struct AcSource {
    cfg: AcConfig,
    decoder: AcDecoder,
}

impl AcSource {
    pub fn new(cfg: AcConfig) -> Self {
        Self { cfg, decoder: AcDecoder::new() }
    }
}

#[async_trait::async_trait]
impl TelemetrySource for AcSource {
    fn kind(&self) -> SourceKind {
        SourceKind::AssettoCorsa
    }

    async fn run(&mut self, tx: TelemetryTx, mut shutdown: Shutdown) -> Result<(), IngestError> {
        let socket = UdpSocket::bind(&self.cfg.listen)
            .await
            .with_context(|| format!("bind {}", self.cfg.listen))?;
        let source = lookup_host(self.cfg.source.as_str())
            .await
            .with_context(|| format!("resolve {}", self.cfg.source))?
            .next()
            .ok_or_else(|| IngestError::Msg(format!("no address for {}", self.cfg.source)))?;

        let session_id = new_session_id(self.kind());
        info!(listen = %self.cfg.listen, %source, session = %session_id, "assetto corsa decoder started");

        let init = self.decoder.start();
        if let Err(e) = socket.send_to(&init, source).await {
            warn!(error = %e, %source, "handshake send failed");
        }

        let mut retry = time::interval(self.cfg.handshake_retry);
        retry.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        retry.tick().await;

        let mut out = Forwarder::new(self.kind(), tx);
        let mut buf = vec![0u8; self.cfg.max_datagram];
        let mut dropped: u64 = 0;
        while !*shutdown.borrow() {
            let waiting = self.decoder.state() == HandshakeState::HandshakeSent;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = retry.tick(), if waiting => {
                    debug!(%source, "no handshake response yet, resending INIT");
                    if let Err(e) = socket.send_to(&init, source).await {
                        warn!(error = %e, %source, "handshake resend failed");
                    }
                }
                res = socket.recv_from(&mut buf) => {
                    let (len, from) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(error = %e, "recv failed");
                            continue;
                        }
                    };
                    match self.decoder.on_datagram(&buf[..len], from) {
                        Inbound::Subscribe { reply, to } => {
                            info!(peer = %to, "handshake answered, subscribing");
                            if let Err(e) = socket.send_to(&reply, to).await {
                                warn!(error = %e, peer = %to, "subscribe send failed");
                            }
                        }
                        Inbound::Telemetry(fields) => {
                            let sample = RawSample { session_id: session_id.clone(), source: self.kind(), fields };
                            if !out.send(SourceEvent::Sample(sample)) {
                                break;
                            }
                        }
                        Inbound::Dropped => {
                            dropped += 1;
                            trace!(len, dropped, "dropped datagram");
                        }
                    }
                }
            }
        }

        // Best-effort goodbye; the socket closes on drop either way.
        if let Some(dismiss) = self.decoder.stop() {
            let target = self.decoder.peer().unwrap_or(source);
            match socket.send_to(&dismiss, target).await {
                Ok(_) => info!(peer = %target, "dismissed"),
                Err(e) => warn!(error = %e, peer = %target, "dismiss send failed"),
            }
        }
        drop(socket);
        out.send(SourceEvent::SessionEnded { session_id });
        if out.dropped() > 0 {
            warn!(dropped = out.dropped(), "samples dropped on a full pipeline channel");
        }
        Ok(())
    }
}
