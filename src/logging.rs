use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("LEAF_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Parse a user-supplied level such as `debug` or `WARN`.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize stderr logging based on `LEAF_LOG`/`RUST_LOG`.
/// Safe to call multiple times; only the first call installs a logger.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], but an explicit level wins over the environment.
pub fn init_logging_with(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let _ = env_logger::Builder::from_env(env)
            .filter_level(level)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}
