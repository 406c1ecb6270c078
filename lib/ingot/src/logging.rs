pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};
use std::fmt;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum LoggingError {
    Config(serdeconv::Error),
    Build(sloggers::Error),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoggingError::Config(err) => write!(f, "invalid logging configuration: {}", err),
            LoggingError::Build(err) => write!(f, "failed to build logger: {}", err),
        }
    }
}

impl std::error::Error for LoggingError {}

/// Builds a logger from a `sloggers` configuration.
pub fn build(config: &LoggerConfig) -> Result<Logger, LoggingError> {
    config.build_logger().map_err(LoggingError::Build)
}

/// Builds a logger from a TOML snippet describing a `sloggers` configuration.
pub fn from_toml(text: &str) -> Result<Logger, LoggingError> {
    let config: LoggerConfig = serdeconv::from_toml_str(text).map_err(LoggingError::Config)?;
    build(&config)
}

/// Default terminal logger used when no configuration is supplied.
pub fn terminal() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("default logging configuration is valid")
}

/// Logger that swallows all records. Used by library consumers that do not
/// care about daemon internals and in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
