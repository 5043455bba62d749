//! Logging setup for the daemon binary

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins over `level`. Thread names are printed because every
/// daemon thread is named after its role (`rsktd-serializer`,
/// `rsktd-app-3.1`, ...). Calling this twice keeps the first subscriber.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .with_thread_names(true)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();

    if installed.is_ok() {
        tracing::debug!(level, "logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("warn");
        init("debug");
        tracing::warn!("still logging");
    }
}
