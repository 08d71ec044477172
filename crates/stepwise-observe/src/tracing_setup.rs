//! Tracing subscriber initialization with structured logging.
//!
//! # Usage
//!
//! ```no_run
//! use stepwise_types::config::LoggingConfig;
//!
//! stepwise_observe::tracing_setup::init_tracing(&LoggingConfig::default()).unwrap();
//! ```

use stepwise_types::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global tracing subscriber.
///
/// - Installs either a human-readable `fmt` layer with target visibility and
///   span close timing, or a JSON layer when `config.json` is set.
/// - Respects `RUST_LOG`; when it is unset or invalid, filters with
///   `config.level`.
///
/// # Errors
///
/// Returns an error if the configured level is not a valid filter directive
/// or if a global subscriber has already been set.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = build_filter(config)?;

    if config.json {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.level)?),
    }
}
