//! Logging setup for binaries and integration harnesses.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to whoever owns the process.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a console subscriber. `RUST_LOG` takes precedence over `base_level`.
///
/// Returns an error instead of panicking when a global subscriber is already set
/// or the filter cannot be parsed.
pub fn init(base_level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(base_level))?;

    let console_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()?;

    Ok(())
}
