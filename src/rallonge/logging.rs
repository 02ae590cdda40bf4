//! Tracing setup: an `EnvFilter` over `RUST_LOG` (or `--log`), a compact
//! formatter on stderr, and a non-blocking writer so a slow terminal never
//! stalls the engine loop.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking writer's background flush thread alive; drop it
/// only at process exit.
#[must_use]
pub struct LoggingGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

pub fn init(override_filter: Option<&str>) -> LoggingGuard {
    let filter = override_filter
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let fmt_layer = fmt::layer().with_writer(writer).with_target(false);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();

    LoggingGuard(guard)
}
