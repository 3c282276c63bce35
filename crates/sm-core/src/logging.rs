//! Logging bootstrap.
//!
//! stdout is reserved for command payloads; all log output goes to
//! stderr. The filter comes from `SMEM_LOG` (falling back to `RUST_LOG`),
//! and `--trace` raises it to debug. `SMEM_LOG_FORMAT=json` switches to
//! JSON lines for agent consumption.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem. Call once at startup.
pub fn init_logging(trace: bool) {
    let default_filter = if trace { "sm=debug,smem=debug" } else { "sm=warn" };
    let filter = std::env::var("SMEM_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json = std::env::var("SMEM_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true);
        tracing_subscriber::registry().with(filter).with(layer).init();
    } else {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time();
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}
