//! Logging setup shared by the CLI and embedding hosts.

use crate::Result;
use tracing_subscriber::EnvFilter;

/// Maps CLI verbosity flags to a tracing level.
///
/// `quiet` wins over any verbosity; otherwise 0 is INFO, 1 is DEBUG and
/// anything higher is TRACE.
pub fn verbosity_level(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

/// Initializes structured logging based on verbosity level.
///
/// A `RUST_LOG` directive in the environment takes precedence over the
/// verbosity flags so individual modules can be traced.
///
/// # Example
/// ```rust,no_run
/// use dsregistry_core::logging::init_logging;
///
/// init_logging(1, false).expect("Failed to initialize logging");
/// ```
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = verbosity_level(verbose, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| {
            crate::error::RegistryError::configuration(format!(
                "Failed to initialize logging: {}",
                e
            ))
        })?;

    Ok(())
}
