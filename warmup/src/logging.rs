use log::{LevelFilter, SetLoggerError};
use simple_logger::SimpleLogger;

/// Initializes the global logger.
///
/// Verbosity only applies to this crate; dependencies log warnings and above.
pub fn init(verbosity: u8) -> Result<(), SetLoggerError> {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .with_module_level(env!("CARGO_CRATE_NAME"), level)
        .with_utc_timestamps()
        .init()
}
