// Tracing subscriber setup for the worker process

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, WorkerConfig};

/// Build the log filter: `RUST_LOG` wins, otherwise `LOG_LEVEL` scoped to the waypoint crates
pub fn log_filter(rust_log: Option<&str>, log_level: &str) -> EnvFilter {
    rust_log
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| {
            EnvFilter::try_new(format!(
                "waypoint_worker={level},waypoint_durable={level}",
                level = log_level
            ))
            .ok()
        })
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &WorkerConfig) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = log_filter(rust_log.as_deref(), &config.log_level);

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
    }
}
