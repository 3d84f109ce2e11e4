pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Builds the default terminal logger. Components hold a child of this root
/// logger and annotate it with their own context pairs.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows all records. Used as the default when a component
/// is constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
