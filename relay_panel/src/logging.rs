// Process-wide logger setup shared by both binaries.
//
// Status lines go to stderr through `env_logger`. The default filter is
// `info` (connection events, relay transitions); `--debug` raises it to
// `debug` (every frame sent). `RUST_LOG`, when set, overrides both.

use env_logger::Env;

pub fn default_filter(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Install the global logger. Safe to call more than once; later calls are
/// ignored.
pub fn init_logging(debug: bool) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter(debug)))
        .format_timestamp_millis()
        .try_init();
}
