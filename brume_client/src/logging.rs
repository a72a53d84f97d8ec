//! Logging initialisation.
//!
//! Library code in this workspace logs through the `log` facade; the binary
//! installs a `tracing` subscriber with a bridge so both ecosystems end up in
//! the same place. `BRUME_LOG` overrides the configured filter.

use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "BRUME_LOG";

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init(default_filter: &str) {
    // Bridge `log` records into `tracing` so library logs are captured.
    let _ = LogTracer::init();

    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
