//! Diagnostic tracing for loopgate itself.
//!
//! Three kinds of output, kept apart:
//!
//! - **Tracing (this module)**: diagnostics on stderr, filtered by
//!   `LOOPGATE_LOG` (or `RUST_LOG` when that is unset). Never persisted.
//! - **Operator output**: iteration banners, echoed agent text and gate
//!   verdicts go to stdout with `println!`.
//! - **Invocation logs (`io/iteration_log`)**: raw agent event streams under
//!   `<sessions-dir>/logs/<id>/`. Always written, unaffected by any filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Preferred filter variable; wins over `RUST_LOG`.
pub const LOG_ENV: &str = "LOOPGATE_LOG";

/// Own warnings (killed agents, failed server teardown) are operator-relevant;
/// dependencies only surface errors.
pub const DEFAULT_DIRECTIVES: &str = "error,loopgate=warn";

/// Install the stderr subscriber.
///
/// ```bash
/// LOOPGATE_LOG=loopgate=debug loopgate run
/// ```
pub fn init() {
    let directives = filter_directives(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|err| {
        eprintln!("ignoring invalid log filter `{directives}`: {err}");
        EnvFilter::new(DEFAULT_DIRECTIVES)
    });

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

/// Pick the filter: `LOOPGATE_LOG`, then `RUST_LOG`, then the defaults.
/// Blank values count as unset.
fn filter_directives(loopgate_log: Option<String>, rust_log: Option<String>) -> String {
    [loopgate_log, rust_log]
        .into_iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string())
}
