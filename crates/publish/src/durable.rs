//! Durable publisher: bounded per-session queues drained into a [`LogSink`]
//! by one background task.
//!
//! Producers never wait. When a session's queue is full the oldest unsent
//! record is dropped and counted. The record currently being written is
//! owned by the drain task, so a retry can never duplicate or lose it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use model::{CompletedLap, TelemetryFrame};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};
use wire::proto::{LapData, LogRecord, RecordKind, TelemetryFrameMsg};

use crate::{LogSink, PublishError, Publisher, RetryPolicy};

#[derive(Debug, Clone)]
pub struct DurableConfig {
    pub topic: String,
    pub capacity_per_session: usize,
    pub retry: RetryPolicy,
}

impl DurableConfig {
    /// Per-user topic name, e.g. `telemetry-user-local`.
    pub fn topic_for(prefix: &str, user_id: &str) -> String {
        format!("{prefix}-user-{user_id}")
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self { topic: Self::topic_for("telemetry", "local"), capacity_per_session: 1024, retry: RetryPolicy::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
    /// Records given up on after exhausting retries.
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: u64,
    pub abandoned: u64,
}

/// Bounded FIFO per session, served round-robin across sessions.
#[derive(Debug)]
struct SessionQueues {
    capacity: usize,
    queues: HashMap<String, VecDeque<LogRecord>>,
    // Sessions with pending records, in service order.
    ready: VecDeque<String>,
    len: usize,
}

impl SessionQueues {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), queues: HashMap::new(), ready: VecDeque::new(), len: 0 }
    }

    /// Returns `true` if the session's oldest record was dropped to make room.
    fn push(&mut self, session_id: &str, record: LogRecord) -> bool {
        if !self.queues.contains_key(session_id) {
            self.ready.push_back(session_id.to_string());
        }
        let q = self.queues.entry(session_id.to_string()).or_default();
        let mut dropped = false;
        if q.len() >= self.capacity {
            q.pop_front();
            self.len -= 1;
            dropped = true;
        }
        q.push_back(record);
        self.len += 1;
        dropped
    }

    fn pop_next(&mut self) -> Option<LogRecord> {
        let session = self.ready.pop_front()?;
        let q = self.queues.get_mut(&session)?;
        let record = q.pop_front();
        if q.is_empty() {
            self.queues.remove(&session);
        } else {
            self.ready.push_back(session);
        }
        if record.is_some() {
            self.len -= 1;
        }
        record
    }

    fn clear(&mut self) -> usize {
        let n = self.len;
        self.queues.clear();
        self.ready.clear();
        self.len = 0;
        n
    }
}

struct Shared {
    topic: String,
    queues: Mutex<SessionQueues>,
    notify: Notify,
    closing: AtomicBool,
    in_flight: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

pub struct DurablePublisher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DurablePublisher {
    /// Spawns the drain task on the current tokio runtime.
    pub fn start<S: LogSink + 'static>(sink: S, cfg: DurableConfig) -> Self {
        let shared = Arc::new(Shared {
            topic: cfg.topic,
            queues: Mutex::new(SessionQueues::new(cfg.capacity_per_session)),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let worker = tokio::spawn(drain(shared.clone(), sink, cfg.retry));
        Self { shared, worker: Mutex::new(Some(worker)) }
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            queued: self.shared.queues.lock().len,
            delivered: self.shared.delivered.load(Ordering::Acquire),
            dropped: self.shared.dropped.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
        }
    }

    /// Stops intake, then lets the drain task flush for up to `grace`.
    /// Whatever is still queued or in flight after that is abandoned.
    pub async fn shutdown(&self, grace: Duration) -> FlushReport {
        self.shared.closing.store(true, Ordering::Release);
        self.shared.notify.notify_one();

        let handle = self.worker.lock().take();
        let mut abandoned = 0;
        if let Some(mut handle) = handle {
            if time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                if self.shared.in_flight.load(Ordering::Acquire) {
                    abandoned += 1;
                }
            }
        }
        abandoned += self.shared.queues.lock().clear() as u64;
        let report = FlushReport { delivered: self.shared.delivered.load(Ordering::Acquire), abandoned };
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "durable publisher abandoned unsent records at shutdown");
        } else {
            info!(delivered = report.delivered, "durable publisher flushed");
        }
        report
    }

    fn enqueue(&self, session_id: &str, kind: RecordKind, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }
        let record = LogRecord { topic: self.shared.topic.clone(), key: session_id.to_string(), kind: kind as i32, payload };
        let dropped = self.shared.queues.lock().push(session_id, record);
        if dropped {
            let n = self.shared.dropped.fetch_add(1, Ordering::AcqRel) + 1;
            // Log at 1, 2, 4, 8, ... so a dead broker cannot flood the log.
            if n.is_power_of_two() {
                warn!(dropped = n, session = %session_id, "durable queue full, dropped oldest record");
            }
        }
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl Publisher for DurablePublisher {
    fn publish_frame(&self, session_id: &str, frame: &TelemetryFrame) -> Result<(), PublishError> {
        self.enqueue(session_id, RecordKind::Frame, TelemetryFrameMsg::from(frame).encode_to_vec())
    }

    fn publish_lap(&self, lap: &CompletedLap) -> Result<(), PublishError> {
        self.enqueue(lap.session_id(), RecordKind::Lap, LapData::from(lap).encode_to_vec())
    }
}

async fn drain<S: LogSink>(shared: Arc<Shared>, mut sink: S, retry: RetryPolicy) {
    loop {
        let next = shared.queues.lock().pop_next();
        let Some(record) = next else {
            if shared.closing.load(Ordering::Acquire) {
                break;
            }
            shared.notify.notified().await;
            continue;
        };

        shared.in_flight.store(true, Ordering::Release);
        let mut retries = 0;
        loop {
            match sink.append(&record).await {
                Ok(()) => {
                    shared.delivered.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                Err(e) if retries < retry.max_retries => {
                    retries += 1;
                    let delay = retry.delay(retries);
                    debug!(error = %e, retry = retries, delay_ms = delay.as_millis() as u64, "durable write failed, backing off");
                    time::sleep(delay).await;
                }
                Err(e) => {
                    shared.failed.fetch_add(1, Ordering::AcqRel);
                    error!(error = %e, session = %record.key, "durable write failed after retries, record abandoned");
                    break;
                }
            }
        }
        shared.in_flight.store(false, Ordering::Release);
    }
    debug!("durable drain task finished");
}
