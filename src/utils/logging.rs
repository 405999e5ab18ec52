use tracing::Level;
use tracing_subscriber::EnvFilter;
use crate::config::LoggingSettings;
use crate::error::AppError;

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), AppError> {
    let level = settings.level.parse::<Level>()
        .map_err(|_| AppError::ConfigError(format!("Unknown log level: {}", settings.level)))?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("celo_balance_ledger={},drop_tables={}", level, level).into());

    let result = match settings.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .try_init(),
        "pretty" => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .pretty()
            .try_init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .compact()
            .try_init(),
        other => return Err(AppError::ConfigError(format!("Unknown log format: {}", other))),
    };

    result.map_err(|e| AppError::InternalError(format!("Failed to install tracing subscriber: {}", e)))
}
