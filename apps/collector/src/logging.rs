use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(cfg: &LoggingSection) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = match cfg.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    if let Err(e) = installed {
        eprintln!("logging already initialised: {e}");
    }
}
