use crate::config::Config;
use log::LevelFilter;
use simplelog::{ConfigBuilder, TermLogger, TerminalMode};

/// HTTP stack internals that log every connection. Hidden below TRACE.
const FILTERED_MODULES: &[&str] = &["reqwest", "hyper", "hyper_util", "rustls", "tracing", "mio"];

pub struct Logger {}

impl Logger {
    pub fn init_logger(config: &Config) {
        let level = config.log_level_filter;
        TermLogger::init(
            level,
            Self::log_config(level),
            TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
        .unwrap_or_else(|e| eprintln!("Logger already initialized: {}", e));
    }

    fn hides_dependencies(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    fn log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        if Self::hides_dependencies(level) {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }
        builder.build()
    }
}
