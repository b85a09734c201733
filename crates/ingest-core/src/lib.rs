//! Core ingest types and traits shared by the simulator decoders.

use crossbeam_channel::TrySendError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, warn};

pub mod le;
pub mod clock;
pub mod normalize;

pub use clock::ProcessClock;
pub use normalize::{normalize, Normalizer};

/// Which wire protocol a sample came from. Drives unit mapping in the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Handshake-style UDP stream.
    AssettoCorsa,
    /// Broadcast channel plus shared-memory snapshots.
    AccHybrid,
    Demo,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::AssettoCorsa => "ac",
            SourceKind::AccHybrid => "acc",
            SourceKind::Demo => "demo",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoder output in source units. `None` means the packet did not carry the field.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawFields {
    pub speed: Option<f32>,
    pub throttle: Option<f32>,
    pub brake: Option<f32>,
    pub steering: Option<f32>,
    pub gear: Option<i32>,
    pub rpm: Option<i32>,
    pub normalized_position: Option<f32>,
    pub lap_number: Option<i32>,
    pub lap_time_ms: Option<i32>,
    pub session_time: Option<f32>,
    pub session_type: Option<i32>,
    pub track_position: Option<i32>,
    pub delta: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub session_id: String,
    pub source: SourceKind,
    pub fields: RawFields,
}

/// What a running decoder hands to the pipeline worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Sample(RawSample),
    SessionEnded { session_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type TelemetryTx = crossbeam_channel::Sender<SourceEvent>;
pub type TelemetryRx = crossbeam_channel::Receiver<SourceEvent>;

/// Flips to `true` once the process starts shutting down.
pub type Shutdown = watch::Receiver<bool>;
pub type ShutdownTrigger = watch::Sender<bool>;

/// Trait for any live source connector.
///
/// `run` owns the socket for its whole lifetime: it binds, performs the
/// protocol handshake, forwards samples until `shutdown` flips, then sends
/// the protocol-level goodbye and returns.
#[async_trait::async_trait]
pub trait TelemetrySource: Send {
    fn kind(&self) -> SourceKind;
    async fn run(&mut self, tx: TelemetryTx, shutdown: Shutdown) -> Result<(), IngestError>;
}

/// Default capacity of the decoder to pipeline hand-off.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Bounded hand-off to the pipeline worker. Decoders never block on it; see
/// [`Forwarder`].
pub fn channel(capacity: usize) -> (TelemetryTx, TelemetryRx) {
    crossbeam_channel::bounded(capacity.max(1))
}

/// Decoder side of the hand-off. Sends without blocking the socket loop and
/// drops the event when the worker has fallen a full channel behind.
#[derive(Debug)]
pub struct Forwarder {
    tx: TelemetryTx,
    kind: SourceKind,
    dropped: u64,
}

impl Forwarder {
    pub fn new(kind: SourceKind, tx: TelemetryTx) -> Self {
        Self { tx, kind, dropped: 0 }
    }

    /// Returns `false` once the worker is gone and the decoder should stop.
    pub fn send(&mut self, event: SourceEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                // 1, 2, 4, 8, ... keeps a stalled worker from flooding the log.
                if self.dropped.is_power_of_two() {
                    warn!(source = %self.kind, dropped = self.dropped, "pipeline channel full, dropping events");
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(source = %self.kind, "pipeline receiver gone");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    watch::channel(false)
}

/// Mints a fresh session id such as `ac-session-6f1c...`.
pub fn new_session_id(kind: SourceKind) -> String {
    format!("{}-session-{}", kind.as_str(), uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ended(n: usize) -> SourceEvent {
        SourceEvent::SessionEnded { session_id: format!("s{n}") }
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let (tx, rx) = channel(3);
        let mut fwd = Forwarder::new(SourceKind::AssettoCorsa, tx);
        for n in 0..10 {
            assert!(fwd.send(ended(n)));
        }
        assert_eq!(fwd.dropped(), 7);
        // The oldest events survive; the overflow is what gets dropped.
        let kept: Vec<SourceEvent> = rx.try_iter().collect();
        assert_eq!(kept, vec![ended(0), ended(1), ended(2)]);

        assert!(fwd.send(ended(10)));
        assert_eq!(fwd.dropped(), 7);
    }

    #[test]
    fn closed_receiver_stops_the_sender() {
        let (tx, rx) = channel(8);
        let mut fwd = Forwarder::new(SourceKind::AccHybrid, tx);
        drop(rx);
        assert!(!fwd.send(ended(0)));
        assert_eq!(fwd.dropped(), 0);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (tx, rx) = channel(0);
        let mut fwd = Forwarder::new(SourceKind::Demo, tx);
        assert!(fwd.send(ended(0)));
        assert_eq!(rx.try_recv().ok(), Some(ended(0)));
    }
}
