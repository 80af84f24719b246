use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "QUOTE_MERGE_LOG";
pub const DEFAULT_FILTER: &str = "quote_merge=info";

/// Install the global tracing subscriber for the command line binary.
///
/// The filter comes from `QUOTE_MERGE_LOG` and falls back to
/// `quote_merge=info`. A subscriber that is already installed (tests, or a
/// host embedding the library) is left in place.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
