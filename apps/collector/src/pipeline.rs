//! Worker that turns decoder events into frames and laps.
//!
//! Runs on its own thread and never touches the network: publishers only
//! enqueue or hand off in-process.

use std::sync::Arc;
use std::thread;

use iox::LapArchive;
use model::CompletedLap;
use publish::Publisher;
use sector_ingest_core::{Normalizer, ProcessClock, SourceEvent, TelemetryRx};
use segmenter::Segmenter;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub laps: u64,
    pub sessions_ended: u64,
    pub publish_errors: u64,
}

pub struct Pipeline {
    normalizer: Normalizer,
    segmenter: Segmenter,
    publisher: Arc<dyn Publisher>,
    archive: Option<LapArchive>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(clock: Arc<ProcessClock>, publisher: Arc<dyn Publisher>, archive: Option<LapArchive>) -> Self {
        Self { normalizer: Normalizer::new(clock), segmenter: Segmenter::new(), publisher, archive, stats: PipelineStats::default() }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn handle(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Sample(sample) => {
                let frame = self.normalizer.normalize(&sample);
                self.stats.frames += 1;
                if let Err(e) = self.publisher.publish_frame(&sample.session_id, &frame) {
                    self.publish_failed("frame", &e);
                }
                if let Some(lap) = self.segmenter.push(&sample.session_id, frame) {
                    self.lap_completed(&lap);
                }
            }
            SourceEvent::SessionEnded { session_id } => {
                self.normalizer.end_session(&session_id);
                self.segmenter.end_session(&session_id);
                self.stats.sessions_ended += 1;
                info!(session = %session_id, "session ended");
            }
        }
    }

    fn lap_completed(&mut self, lap: &CompletedLap) {
        self.stats.laps += 1;
        if let Err(e) = self.publisher.publish_lap(lap) {
            self.publish_failed("lap", &e);
        }
        if let Some(archive) = self.archive.as_mut() {
            if let Err(e) = archive.append(lap) {
                warn!(error = %e, path = %archive.path().display(), "failed to archive lap");
            }
        }
    }

    fn publish_failed(&mut self, what: &str, e: &publish::PublishError) {
        self.stats.publish_errors += 1;
        // Log at 1, 2, 4, 8, ... so a closed intake cannot flood the log.
        if self.stats.publish_errors.is_power_of_two() {
            warn!(error = %e, what, errors = self.stats.publish_errors, "publish failed");
        } else {
            debug!(error = %e, what, "publish failed");
        }
    }

    /// Drains `rx` until every sender is gone.
    pub fn run(mut self, rx: TelemetryRx) -> PipelineStats {
        for event in rx {
            self.handle(event);
        }
        if self.segmenter.session_count() > 0 {
            debug!(sessions = self.segmenter.session_count(), "pipeline stopped with open laps");
        }
        self.stats()
    }
}

pub fn spawn(pipeline: Pipeline, rx: TelemetryRx) -> std::io::Result<thread::JoinHandle<PipelineStats>> {
    thread::Builder::new().name("sector-pipeline".into()).spawn(move || pipeline.run(rx))
}
