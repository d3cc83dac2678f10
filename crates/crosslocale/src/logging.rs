//! Tracing subscriber setup shared by the host adapters.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Map a `CROSSLOCALE_LOG` value to a filter directive.
fn filter_directive(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("crosslocale={base_level},crosslocale_py={base_level}")
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `CROSSLOCALE_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Returns `false` when a
/// subscriber was already installed, so repeated calls are harmless.
pub fn init_tracing() -> bool {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directive(
            std::env::var("CROSSLOCALE_LOG").ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let installed = if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    if installed.is_ok() {
        tracing::debug!(version = crate::NICE_VERSION, "Logging initialized");
    }
    installed.is_ok()
}
