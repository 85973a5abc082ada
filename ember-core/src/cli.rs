use clap::{Args, ValueEnum};
use log::LevelFilter;

/// Log level options for command-line argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Common command-line arguments shared by every Ember application.
///
/// Applications embed this with `#[command(flatten)]` next to their own options.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Set the log verbosity level
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Serve puffin profiling data on the default port
    #[arg(long = "profile", default_value_t = false)]
    pub profile: bool,
}

impl EngineArgs {
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        engine: EngineArgs,
    }

    #[test]
    fn defaults_to_info_without_profiling() {
        let cli = TestCli::try_parse_from(["app"]).unwrap();
        assert_eq!(cli.engine.log_level, LogLevel::Info);
        assert_eq!(cli.engine.level_filter(), LevelFilter::Info);
        assert!(!cli.engine.profile);
    }

    #[test]
    fn parses_short_log_level_flag() {
        let cli = TestCli::try_parse_from(["app", "-l", "trace", "--profile"]).unwrap();
        assert_eq!(cli.engine.level_filter(), LevelFilter::Trace);
        assert!(cli.engine.profile);
    }
}
