//! TOML configuration. Every section and key is optional; anything missing
//! takes the default listed on the struct.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bridge::BridgeConfig;
use publish::{DurableConfig, RetryPolicy};
use sector_ingest_ac::AcConfig;
use sector_ingest_acc::AccConfig;
use sector_ingest_core::DEFAULT_CHANNEL_CAPACITY;
use wire::Encoding;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub ac: AcSection,
    pub acc: AccSection,
    pub decoder: DecoderSection,
    pub bridge: BridgeSection,
    pub publisher: PublisherSection,
    pub archive: ArchiveSection,
    pub logging: LoggingSection,
}

/// Handshake-style UDP source
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcSection {
    pub enabled: bool,
    pub listen: String,
    pub source: String,
    pub handshake_retry_ms: u64,
}

impl Default for AcSection {
    fn default() -> Self {
        Self { enabled: true, listen: "0.0.0.0:9996".into(), source: "127.0.0.1:9996".into(), handshake_retry_ms: 2000 }
    }
}

/// Broadcast + shared memory source
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccSection {
    pub enabled: bool,
    pub listen: String,
    pub broadcast: String,
    pub display_name: String,
    pub connection_password: String,
    pub command_password: String,
    pub update_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub registration_retry_ms: u64,
    pub snapshot_max_age_ms: u64,
    pub shared_memory_poll_ms: u64,
}

impl Default for AccSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:0".into(),
            broadcast: "127.0.0.1:9000".into(),
            display_name: "Sector".into(),
            connection_password: "asd".into(),
            command_password: String::new(),
            update_interval_ms: 100,
            keepalive_interval_ms: 100,
            registration_retry_ms: 5000,
            snapshot_max_age_ms: 500,
            shared_memory_poll_ms: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecoderSection {
    pub max_datagram: usize,
    /// Events buffered between the decoders and the pipeline worker
    pub channel_capacity: usize,
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self { max_datagram: 2048, channel_capacity: DEFAULT_CHANNEL_CAPACITY }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeSection {
    pub listen: String,
    pub demo_fps: u32,
    pub outbound_queue: usize,
    pub max_message_size: usize,
    pub encoding: Encoding,
    /// Generated in-process when unset or unreadable
    pub demo_dataset: Option<PathBuf>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        let b = BridgeConfig::default();
        Self {
            listen: b.listen,
            demo_fps: b.demo_fps,
            outbound_queue: b.outbound_queue,
            max_message_size: b.max_message_size,
            encoding: b.encoding,
            demo_dataset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherMode {
    #[default]
    Direct,
    Durable,
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublisherSection {
    pub mode: PublisherMode,
    pub endpoint: String,
    pub topic_prefix: String,
    pub user_id: String,
    pub queue_capacity: usize,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub max_retries: u32,
    pub io_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            mode: PublisherMode::Direct,
            endpoint: "127.0.0.1:9092".into(),
            topic_prefix: "telemetry".into(),
            user_id: "local".into(),
            queue_capacity: 1024,
            retry_initial_ms: 300,
            retry_max_ms: 30_000,
            max_retries: 5,
            io_timeout_ms: 5000,
            shutdown_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveSection {
    /// NDJSON file completed laps are appended to
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Pretty }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let config: Config = toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::from_file)
    }

    pub fn ac_config(&self) -> AcConfig {
        AcConfig {
            listen: self.ac.listen.clone(),
            source: self.ac.source.clone(),
            max_datagram: self.decoder.max_datagram,
            handshake_retry: Duration::from_millis(self.ac.handshake_retry_ms),
        }
    }

    pub fn acc_config(&self) -> AccConfig {
        let a = &self.acc;
        AccConfig {
            listen: a.listen.clone(),
            broadcast: a.broadcast.clone(),
            display_name: a.display_name.clone(),
            connection_password: a.connection_password.clone(),
            command_password: a.command_password.clone(),
            update_interval: Duration::from_millis(a.update_interval_ms),
            keepalive_interval: Duration::from_millis(a.keepalive_interval_ms),
            registration_retry: Duration::from_millis(a.registration_retry_ms),
            snapshot_max_age: Duration::from_millis(a.snapshot_max_age_ms),
            shared_memory_poll: Duration::from_millis(a.shared_memory_poll_ms),
            max_datagram: self.decoder.max_datagram,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let b = &self.bridge;
        BridgeConfig {
            listen: b.listen.clone(),
            demo_fps: b.demo_fps,
            outbound_queue: b.outbound_queue,
            max_message_size: b.max_message_size,
            encoding: b.encoding,
        }
    }

    pub fn durable_config(&self) -> DurableConfig {
        let p = &self.publisher;
        DurableConfig {
            topic: DurableConfig::topic_for(&p.topic_prefix, &p.user_id),
            capacity_per_session: p.queue_capacity,
            retry: RetryPolicy {
                initial: Duration::from_millis(p.retry_initial_ms),
                max: Duration::from_millis(p.retry_max_ms),
                max_retries: p.max_retries,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let c = Config::default();
        assert_eq!(c.ac.listen, "0.0.0.0:9996");
        assert_eq!(c.acc.broadcast, "127.0.0.1:9000");
        assert_eq!(c.bridge.listen, "0.0.0.0:8080");
        assert_eq!(c.bridge.demo_fps, 30);
        assert_eq!(c.bridge.max_message_size, 10 * 1024 * 1024);
        assert_eq!(c.publisher.mode, PublisherMode::Direct);
        assert_eq!(c.durable_config().topic, "telemetry-user-local");
        assert_eq!(c.durable_config().retry, RetryPolicy::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let c: Config = toml::from_str(
            r#"
[acc]
display_name = "Pit Wall"
keepalive_interval_ms = 250

[bridge]
encoding = "json"

[publisher]
mode = "both"
user_id = "alice"

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(c.acc.display_name, "Pit Wall");
        assert_eq!(c.acc_config().keepalive_interval, Duration::from_millis(250));
        assert_eq!(c.acc_config().registration_retry, Duration::from_secs(5));
        assert_eq!(c.bridge.encoding, Encoding::Json);
        assert_eq!(c.publisher.mode, PublisherMode::Both);
        assert_eq!(c.durable_config().topic, "telemetry-user-alice");
        assert_eq!(c.logging.format, LogFormat::Json);
        assert!(c.ac.enabled);
    }

    #[test]
    fn decoder_limit_flows_into_both_sources() {
        let c: Config = toml::from_str("[decoder]\nmax_datagram = 4096\n").unwrap();
        assert_eq!(c.ac_config().max_datagram, 4096);
        assert_eq!(c.acc_config().max_datagram, 4096);
        assert_eq!(c.decoder.channel_capacity, 4096);
    }

    #[test]
    fn channel_capacity_is_configurable() {
        let c: Config = toml::from_str("[decoder]\nchannel_capacity = 256\n").unwrap();
        assert_eq!(c.decoder.channel_capacity, 256);
        assert_eq!(c.decoder.max_datagram, 2048);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(toml::from_str::<Config>("[publisher]\nmode = \"carrier-pigeon\"\n").is_err());
    }

    #[test]
    fn from_file_reports_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sector.toml");
        fs::write(&path, "[ac]\nsource = \"10.0.0.5:9996\"\n")?;
        assert_eq!(Config::load(Some(&path))?.ac.source, "10.0.0.5:9996");

        let err = Config::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
        Ok(())
    }
}
