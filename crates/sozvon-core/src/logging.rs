//! `tracing` subscriber setup.
//!
//! Both services log human-readable lines to stderr. `RUST_LOG` takes
//! precedence over the configured level.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with stderr output.
///
/// Call once at startup. Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - Filter directive used when `RUST_LOG` is unset, e.g. `"info"`
///   or `"sozvon_relay=debug,info"`.
pub fn init_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init fails if a global subscriber is already set
    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_subscriber_does_not_panic() {
        init_subscriber("warn");
        init_subscriber("debug");
    }

    #[test]
    fn invalid_directive_falls_back() {
        init_subscriber("not a [valid] directive");
    }
}
