//! Logging setup.
//!
//! Logs go to stderr so stdout stays machine-readable (`claim` prints a bare
//! `true`/`false`, `status` prints JSON).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Filter directives, e.g. `HANDSHAKE_LOG=handshake=debug`.
pub const LOG_ENV: &str = "HANDSHAKE_LOG";
/// Set to `json` for one JSON object per log line.
pub const LOG_FORMAT_ENV: &str = "HANDSHAKE_LOG_FORMAT";

const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber. Warns if one is already installed.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NONE);

    let result = if json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.with_target(false).try_init()
    };

    if let Err(e) = result {
        eprintln!("warning: logging already initialized: {e}");
    }
}
