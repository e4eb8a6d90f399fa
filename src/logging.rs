//! Structured logging setup (`tracing` + `tracing-subscriber`).

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub timestamps: bool,
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: false,
            include_target: false,
        }
    }
}

impl LogConfig {
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self {
                level: Level::WARN,
                ..Self::default()
            },
            (false, true) => Self {
                level: Level::DEBUG,
                timestamps: true,
                include_target: true,
            },
            _ => Self::default(),
        }
    }
}

pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let builder = FmtSubscriber::builder()
        .with_max_level(config.level)
        .with_target(config.include_target)
        .compact();
    let result = if config.timestamps {
        tracing::subscriber::set_global_default(builder.finish())
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())
    };
    result.map_err(|e| format!("Failed to initialize logging: {}", e))
}
