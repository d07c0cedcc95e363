pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the process-wide terminal logger. Components derive their own
/// child loggers from the returned root.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger config");

    config.build_logger().expect("Error building logger")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_builds_a_logger() {
        let logger = init();

        info!(logger, "logger constructed"; "context" => "test");
    }
}
