//! Tracing setup for binaries and tests that embed the crate.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `FORKPOOL_LOG` picks the level for this crate
/// (`error`, `warn`, `info`, `debug`, `trace`; default `info`). `LOG_FORMAT=json` switches to
/// JSON lines. Calling this twice is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("FORKPOOL_LOG")
            .map(|v| level_name(&v))
            .unwrap_or("info");
        EnvFilter::new(format!("forkpool={level}"))
    };

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init();
    }
}

fn level_name(value: &str) -> &'static str {
    match value.trim().to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}
