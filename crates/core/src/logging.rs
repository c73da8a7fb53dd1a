//! Logging initialization shared by xfrmguard binaries.
//!
//! Configures `tracing-subscriber` from the `[general]` section of
//! [`XfrmGuardConfig`](crate::config::XfrmGuardConfig). `RUST_LOG` takes
//! precedence over `general.log_level` when set.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::GeneralConfig;
use crate::error::XfrmGuardError;

/// Initialize the global tracing subscriber.
///
/// Must be called at most once per process; a second call returns
/// [`XfrmGuardError::Logging`].
///
/// # Formats
///
/// * `"json"` - Machine-parseable JSON lines (default)
/// * `"pretty"` - Human-readable output for development
pub fn init_tracing(config: &GeneralConfig) -> Result<(), XfrmGuardError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| {
                XfrmGuardError::Logging(format!("failed to initialize JSON subscriber: {e}"))
            }),
        "pretty" => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| {
                XfrmGuardError::Logging(format!("failed to initialize pretty subscriber: {e}"))
            }),
        other => Err(XfrmGuardError::Logging(format!(
            "unknown log format '{other}', expected 'json' or 'pretty'"
        ))),
    }
}
