use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use switchboard_config::{LogFormat, LoggingConfig};

/// Build the filter for a config.
///
/// Explicit `filter` directives win, then `RUST_LOG`, then the configured level.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Some(directives) = &config.filter {
        return EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid log filter '{}'", directives));
    }

    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str())))
}

/// Initialize logging from configuration
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(config)?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(config.include_target)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(config.include_target)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(config.include_target)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(config.include_target)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .boxed(),
    };

    // try_init so a second initialisation is a no-op rather than a panic
    if tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_filter_wins() {
        let config = LoggingConfig {
            filter: Some("switchboard_session=trace".to_string()),
            ..Default::default()
        };
        let filter = build_env_filter(&config).unwrap();
        assert!(filter.to_string().contains("switchboard_session=trace"));
    }

    #[test]
    fn test_bad_filter_is_error() {
        let config = LoggingConfig {
            filter: Some("switchboard_session=notalevel".to_string()),
            ..Default::default()
        };
        assert!(build_env_filter(&config).is_err());
    }
}
