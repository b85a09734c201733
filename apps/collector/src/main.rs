mod config;
mod logging;
mod pipeline;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{error, info, warn};

use bridge::{server, Bridge};
use config::{Config, PublisherMode};
use iox::LapArchive;
use model::TelemetryFrame;
use pipeline::Pipeline;
use publish::{DirectPublisher, DurablePublisher, Fanout, Publisher, TcpLogSink};
use sector_ingest_ac::AcSource;
use sector_ingest_acc::AccSource;
use sector_ingest_core::{
    channel, shutdown_channel, IngestError, ProcessClock, Shutdown, SourceKind, TelemetrySource, TelemetryTx,
};

const DECODER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const BRIDGE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "sector", version, about = "Sim-racing telemetry collector and live viewer bridge")]
struct Cli {
    /// TOML config file; built-in defaults when omitted
    #[arg(long, short, env = "SECTOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the decoders, lap pipeline and viewer bridge
    Run {
        /// Bridge listen address
        #[arg(long, env = "SECTOR_LISTEN")]
        listen: Option<String>,
        /// Address of the machine running the handshake-style game
        #[arg(long, env = "SECTOR_SOURCE")]
        source: Option<String>,
        /// Run a single decoder instead of both
        #[arg(long, value_enum)]
        only: Option<Only>,
    },
    /// Run the viewer bridge alone (demo playback only)
    Bridge {
        #[arg(long, env = "SECTOR_LISTEN")]
        listen: Option<String>,
    },
    /// Write the generated demo dataset as JSON
    GenerateDemo {
        #[arg(default_value = "demo-data/demo-telemetry.json")]
        path: PathBuf,
    },
    /// Convert an NDJSON lap archive to CSV
    ExportCsv { archive: PathBuf, out: PathBuf },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Only {
    Ac,
    Acc,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;
    logging::init(&cfg.logging);

    match cli.command {
        Command::Run { listen, source, only } => {
            if let Some(l) = listen {
                cfg.bridge.listen = l;
            }
            if let Some(s) = source {
                cfg.ac.source = s;
            }
            match only {
                Some(Only::Ac) => cfg.acc.enabled = false,
                Some(Only::Acc) => cfg.ac.enabled = false,
                None => {}
            }
            run(cfg).await
        }
        Command::Bridge { listen } => {
            if let Some(l) = listen {
                cfg.bridge.listen = l;
            }
            run_bridge(cfg).await
        }
        Command::GenerateDemo { path } => generate_demo(&path),
        Command::ExportCsv { archive, out } => {
            let laps = iox::read_archive(&archive)?;
            iox::export_csv(&laps, &out)?;
            info!(laps = laps.len(), out = %out.display(), "archive exported");
            Ok(())
        }
    }
}

fn generate_demo(path: &Path) -> Result<()> {
    let ds = demo::generate();
    iox::save_dataset(&ds, path).with_context(|| format!("write {}", path.display()))?;
    info!(path = %path.display(), laps = ds.laps.len(), frames = ds.frame_count(), frame_rate = ds.frame_rate, "demo dataset written");
    Ok(())
}

/// Flattened demo frames for the bridge. Falls back to the generator when
/// the configured file cannot be read.
fn demo_frames(cfg: &Config) -> Vec<TelemetryFrame> {
    let ds = match &cfg.bridge.demo_dataset {
        Some(path) => iox::load_dataset(path).unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "demo dataset unreadable, using generated laps");
            demo::generate()
        }),
        None => demo::generate(),
    };
    info!(laps = ds.laps.len(), frames = ds.frame_count(), "demo dataset ready");
    ds.flatten()
}

fn build_publisher(cfg: &Config, bridge: &Bridge) -> (Arc<dyn Publisher>, Option<Arc<DurablePublisher>>) {
    let direct = || Arc::new(DirectPublisher::new(Arc::new(bridge.clone()))) as Arc<dyn Publisher>;
    let durable = || {
        let sink = TcpLogSink::new(cfg.publisher.endpoint.clone(), Duration::from_millis(cfg.publisher.io_timeout_ms));
        let d = Arc::new(DurablePublisher::start(sink, cfg.durable_config()));
        info!(endpoint = %cfg.publisher.endpoint, topic = %cfg.durable_config().topic, "durable publisher started");
        d
    };
    match cfg.publisher.mode {
        PublisherMode::Direct => (direct(), None),
        PublisherMode::Durable => {
            warn!("publisher mode is durable only, live viewers will not receive frames from this process");
            let d = durable();
            (d.clone() as Arc<dyn Publisher>, Some(d))
        }
        PublisherMode::Both => {
            let d = durable();
            let fanout = Fanout::new(vec![direct(), d.clone() as Arc<dyn Publisher>]);
            (Arc::new(fanout) as Arc<dyn Publisher>, Some(d))
        }
    }
}

type DecoderSet = JoinSet<(SourceKind, Result<(), IngestError>)>;

fn spawn_source<S: TelemetrySource + 'static>(set: &mut DecoderSet, mut src: S, tx: TelemetryTx, shutdown: Shutdown) {
    set.spawn(async move {
        let kind = src.kind();
        (kind, src.run(tx, shutdown).await)
    });
}

/// Resolves with the first decoder failure. Decoders that return cleanly
/// are logged and skipped; `None` once every decoder is gone.
async fn first_failure(set: &mut DecoderSet) -> Option<anyhow::Error> {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((kind, Ok(()))) => info!(source = %kind, "decoder finished"),
            Ok((kind, Err(e))) => {
                error!(source = %kind, error = %e, "decoder failed");
                return Some(anyhow::Error::new(e).context(format!("{kind} decoder failed")));
            }
            Err(e) => {
                error!(error = %e, "decoder task panicked");
                return Some(anyhow::Error::new(e).context("decoder task panicked"));
            }
        }
    }
    None
}

async fn run(cfg: Config) -> Result<()> {
    run_until(cfg, async { tokio::signal::ctrl_c().await.context("install ctrl-c handler") }).await
}

/// Runs until `stop` resolves or a decoder fails, then shuts down in order:
/// decoders, pipeline, bridge, durable publisher. A decoder failure is
/// returned after the shutdown completes.
async fn run_until<F>(cfg: Config, stop: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let bridge = Bridge::new(cfg.bridge_config(), demo_frames(&cfg));
    let listener = server::bind(&cfg.bridge.listen).await?;
    let (bridge_stop, bridge_shutdown) = shutdown_channel();
    let server = tokio::spawn(server::serve(bridge.clone(), listener, bridge_shutdown));

    let (publisher, durable) = build_publisher(&cfg, &bridge);
    let archive = cfg.archive.path.as_deref().map(LapArchive::open).transpose()?;
    let (tx, rx) = channel(cfg.decoder.channel_capacity);
    let worker = pipeline::spawn(Pipeline::new(Arc::new(ProcessClock::new()), publisher, archive), rx)
        .context("spawn pipeline thread")?;

    let (decoder_stop, decoder_shutdown) = shutdown_channel();
    let mut decoders = DecoderSet::new();
    if cfg.ac.enabled {
        spawn_source(&mut decoders, AcSource::new(cfg.ac_config()), tx.clone(), decoder_shutdown.clone());
    }
    if cfg.acc.enabled {
        spawn_source(&mut decoders, AccSource::new(cfg.acc_config()), tx.clone(), decoder_shutdown.clone());
    }
    drop(tx);
    drop(decoder_shutdown);
    info!(decoders = decoders.len(), bridge = %cfg.bridge.listen, "sector running, ctrl-c to stop");

    let outcome = tokio::select! {
        res = stop => res,
        Some(e) = first_failure(&mut decoders) => Err(e),
    };
    info!("shutting down");

    // Decoders first so they can still send their dismiss / unregister.
    let _ = decoder_stop.send(true);
    let drained = time::timeout(DECODER_STOP_TIMEOUT, async {
        while let Some(joined) = decoders.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((kind, Err(e))) => warn!(source = %kind, error = %e, "decoder stopped with error"),
                Err(e) => warn!(error = %e, "decoder task failed"),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = decoders.len(), "decoders did not stop in time, aborting");
        decoders.abort_all();
    }
    // Aborted tasks release their senders once they are dropped.
    drop(decoders);

    // The worker exits once the last decoder drops its sender.
    match tokio::task::spawn_blocking(move || worker.join()).await {
        Ok(Ok(stats)) => info!(frames = stats.frames, laps = stats.laps, publish_errors = stats.publish_errors, "pipeline drained"),
        _ => error!("pipeline thread panicked"),
    }

    stop_bridge(bridge_stop, server).await;

    if let Some(d) = durable {
        let grace = Duration::from_millis(cfg.publisher.shutdown_grace_ms);
        let report = d.shutdown(grace).await;
        let stats = d.stats();
        info!(delivered = report.delivered, abandoned = report.abandoned, dropped = stats.dropped, failed = stats.failed, "durable publisher closed");
    }
    info!("bye");
    outcome
}

async fn run_bridge(cfg: Config) -> Result<()> {
    let bridge = Bridge::new(cfg.bridge_config(), demo_frames(&cfg));
    let listener = server::bind(&cfg.bridge.listen).await?;
    let (stop, shutdown) = shutdown_channel();
    let server = tokio::spawn(server::serve(bridge, listener, shutdown));

    tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
    info!("shutting down");
    stop_bridge(stop, server).await;
    Ok(())
}

async fn stop_bridge(stop: sector_ingest_core::ShutdownTrigger, mut server: JoinHandle<Result<(), bridge::BridgeError>>) {
    let _ = stop.send(true);
    match time::timeout(BRIDGE_STOP_TIMEOUT, &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "bridge server stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "bridge server task failed"),
        Err(_) => {
            warn!("bridge server did not stop in time, aborting");
            server.abort();
        }
    }
}
