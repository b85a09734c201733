//! Publishers: where normalized frames and completed laps go next.
//!
//! [`DurablePublisher`] queues into an external per-user log from a
//! background task. [`DirectPublisher`] hands frames straight to an
//! in-process [`FrameIntake`] such as the distribution bridge.

use std::sync::Arc;

use model::{CompletedLap, TelemetryFrame};

pub mod durable;
pub mod retry;
pub mod sink;

pub use durable::{DurableConfig, DurablePublisher, FlushReport, PublishStats};
pub use retry::RetryPolicy;
pub use sink::{LogSink, TcpLogSink};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher is shut down")]
    Closed,
    #[error("intake rejected frame: {0}")]
    Rejected(String),
    #[error("log write failed: {0}")]
    Sink(#[from] std::io::Error),
    #[error("log write timed out")]
    Timeout,
}

/// Both calls return without waiting on any network I/O.
pub trait Publisher: Send + Sync {
    fn publish_frame(&self, session_id: &str, frame: &TelemetryFrame) -> Result<(), PublishError>;
    fn publish_lap(&self, lap: &CompletedLap) -> Result<(), PublishError>;
}

/// Receiving side of an in-process hand-off.
pub trait FrameIntake: Send + Sync {
    fn accept_frame(&self, session_id: &str, frame: &TelemetryFrame) -> Result<(), PublishError>;

    fn accept_lap(&self, _lap: &CompletedLap) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Synchronous hand-off with no queue and no retry; intake errors surface
/// to the caller unchanged.
pub struct DirectPublisher {
    intake: Arc<dyn FrameIntake>,
}

impl DirectPublisher {
    pub fn new(intake: Arc<dyn FrameIntake>) -> Self {
        Self { intake }
    }
}

impl Publisher for DirectPublisher {
    fn publish_frame(&self, session_id: &str, frame: &TelemetryFrame) -> Result<(), PublishError> {
        self.intake.accept_frame(session_id, frame)
    }

    fn publish_lap(&self, lap: &CompletedLap) -> Result<(), PublishError> {
        self.intake.accept_lap(lap)
    }
}

/// Publishes to every inner publisher. All of them are tried; the first
/// error is returned.
pub struct Fanout {
    targets: Vec<Arc<dyn Publisher>>,
}

impl Fanout {
    pub fn new(targets: Vec<Arc<dyn Publisher>>) -> Self {
        Self { targets }
    }

    fn each(&self, f: impl Fn(&dyn Publisher) -> Result<(), PublishError>) -> Result<(), PublishError> {
        let mut first = None;
        for t in &self.targets {
            if let Err(e) = f(t.as_ref()) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Publisher for Fanout {
    fn publish_frame(&self, session_id: &str, frame: &TelemetryFrame) -> Result<(), PublishError> {
        self.each(|p| p.publish_frame(session_id, frame))
    }

    fn publish_lap(&self, lap: &CompletedLap) -> Result<(), PublishError> {
        self.each(|p| p.publish_lap(lap))
    }
}
