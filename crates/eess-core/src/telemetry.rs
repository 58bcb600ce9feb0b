use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = fmt().with_env_filter(filter).with_target(false).try_init() {
        warn!(error = %e, "tracing init failed");
    }
}
