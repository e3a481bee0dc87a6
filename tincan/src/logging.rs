//! Logging init plus the runtime level switch behind `SetLoggingLevel`.

use anyhow::{Context as _, Result, bail};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry, reload};

pub struct LogController {
    handle: reload::Handle<EnvFilter, Registry>,
}

/// Installs the global subscriber. `RUST_LOG` wins at startup; the
/// controller can change the level later.
pub fn init() -> Result<LogController> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    Ok(LogController { handle })
}

impl LogController {
    /// Maps the controller's level names onto filter directives.
    pub fn set_level(&self, level: &str) -> Result<()> {
        let directive = match level.to_ascii_uppercase().as_str() {
            "NONE" => "off",
            "ERROR" => "error",
            "WARNING" => "warn",
            "INFO" => "info",
            "VERBOSE" | "DEBUG" => "debug",
            "SENSITIVE" => "trace",
            other => bail!("`{other}` is not a logging level"),
        };

        self.handle
            .reload(EnvFilter::new(directive))
            .context("Failed to reload the log filter")?;

        tracing::info!(%level, "Logging level changed");

        Ok(())
    }
}
