pub use log::{trace, debug, info, warn, error, log_enabled, Level, LevelFilter};

pub fn initialize(level: LevelFilter) -> Result<(), anyhow::Error> {
    env_logger::builder()
        .filter_level(level)
        .filter_module("winit", LevelFilter::Warn)
        .filter_module("calloop", LevelFilter::Warn)
        .filter_module("puffin_http", LevelFilter::Warn)
        .format_timestamp_millis()
        .parse_default_env()
        .try_init()?;

    Ok(())
}

/// Install a logger that captures output for the test harness. Safe to call repeatedly.
pub fn initialize_for_tests() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
