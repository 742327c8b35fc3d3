//! Logging setup for the bundle_adjust binary and tests.
//!
//! All progress output of a run (pass banners, `Writing: ...` lines,
//! outlier statistics, solver summaries) is emitted at INFO under this
//! crate's target. The default filter keeps that chatter scoped to the
//! adjustment itself and leaves dependencies at WARN; `RUST_LOG` overrides
//! it entirely.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,apogee_adjust=info,bundle_adjust=info";

/// Initialize the tracing subscriber for a bundle adjustment run.
///
/// # Example
/// ```no_run
/// use apogee_adjust::init_logger;
///
/// fn main() {
///     init_logger();
///     tracing::info!("Starting bundle adjustment");
/// }
/// ```
pub fn init_logger() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
