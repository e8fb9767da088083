//! Checks run on a loaded configuration before anything connects.

use super::error::{ConfigError, ConfigResult};
use super::schema::{CommandsConfig, FerrumConfig, GatewaySettings, LogOutput};

/// Rejects configurations the runtime cannot start with.
pub fn validate_config(config: &FerrumConfig) -> ConfigResult<()> {
    let client = &config.client;
    if client.token.trim().is_empty() {
        return Err(ConfigError::missing_field("client.token"));
    }
    require_scheme(&client.api_base, &["https", "http"])?;
    if let Some(url) = &client.gateway_url {
        require_scheme(url, &["wss", "ws"])?;
    }
    ensure(client.request_timeout_secs > 0, "client.request_timeout_secs must be at least 1")?;

    check_gateway(&config.gateway)?;
    check_commands(&config.commands)?;

    if config.logging.output == LogOutput::File && config.logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

fn check_gateway(gateway: &GatewaySettings) -> ConfigResult<()> {
    let backoff = &gateway.backoff;
    ensure(backoff.initial_delay_ms > 0, "gateway.backoff.initial_delay_ms must be at least 1")?;
    ensure(
        backoff.max_delay_ms >= backoff.initial_delay_ms,
        "gateway.backoff.max_delay_ms is below initial_delay_ms",
    )?;
    ensure(
        backoff.multiplier.is_finite() && backoff.multiplier >= 1.0,
        "gateway.backoff.multiplier must be a finite number >= 1",
    )?;
    ensure(gateway.sweep_interval_ms > 0, "gateway.sweep_interval_ms must be at least 1")
}

fn check_commands(commands: &CommandsConfig) -> ConfigResult<()> {
    ensure(
        commands.prefixes.iter().all(|p| !p.is_empty()),
        "commands.prefixes contains an empty prefix",
    )?;
    ensure(
        !commands.prefixes.is_empty() || commands.when_mentioned,
        "commands.prefixes is empty and when_mentioned is off, no message could match",
    )?;
    if let Some(cooldown) = &commands.default_cooldown {
        ensure(cooldown.rate > 0, "commands.default_cooldown.rate must be at least 1")?;
        ensure(
            cooldown.per_secs.is_finite() && cooldown.per_secs > 0.0,
            "commands.default_cooldown.per_secs must be positive",
        )?;
    }
    if let Some(concurrency) = &commands.default_concurrency {
        ensure(concurrency.limit > 0, "commands.default_concurrency.limit must be at least 1")?;
    }
    Ok(())
}

fn ensure(condition: bool, message: &str) -> ConfigResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::invalid(message))
    }
}

fn require_scheme(url: &str, schemes: &[&str]) -> ConfigResult<()> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme);
    match scheme {
        Some(scheme) if schemes.contains(&scheme) => Ok(()),
        _ => Err(ConfigError::invalid_url(
            url,
            format!("expected a {} URL", schemes.join(" or ")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyConfig, CooldownConfig};
    use ferrum_commands::BucketScope;

    fn valid() -> FerrumConfig {
        let mut config = FerrumConfig::default();
        config.client.token = "token".to_string();
        config
    }

    #[test]
    fn test_defaults_need_a_token() {
        assert!(matches!(
            validate_config(&FerrumConfig::default()),
            Err(ConfigError::MissingField { field }) if field == "client.token"
        ));
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let mut config = valid();
        config.commands.prefixes = vec![String::new()];
        assert!(validate_config(&config).is_err());

        config.commands.prefixes.clear();
        assert!(validate_config(&config).is_err());
        config.commands.when_mentioned = true;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = valid();
        config.commands.default_cooldown = Some(CooldownConfig {
            rate: 0,
            per_secs: 5.0,
            scope: BucketScope::User,
        });
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid { .. })
        ));

        let mut config = valid();
        config.commands.default_concurrency = Some(ConcurrencyConfig {
            limit: 0,
            scope: BucketScope::Global,
            wait: false,
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_urls() {
        let mut config = valid();
        config.client.gateway_url = Some("https://gateway.example".into());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUrl { .. })
        ));

        let mut config = valid();
        config.client.api_base = "api.example".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = valid();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());
    }
}
