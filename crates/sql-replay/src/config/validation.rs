//! Configuration validation.

use super::{BaselineMode, Config};
use crate::error::{ReplayError, Result};
use crate::tls::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if let Some(source) = &config.source {
        if source.host.is_empty() {
            return Err(ReplayError::Config("source.host is required".into()));
        }
        if source.database.is_empty() {
            return Err(ReplayError::Config("source.database is required".into()));
        }
        if source.user.is_empty() {
            return Err(ReplayError::Config("source.user is required".into()));
        }
        match source.r#type.as_str() {
            "mssql" => {}
            "postgres" => {
                SslMode::parse(&source.ssl_mode)?;
            }
            other => {
                return Err(ReplayError::Config(format!(
                    "source.type must be 'mssql' or 'postgres', got '{}'",
                    other
                )));
            }
        }
    }

    // Target validation
    let target = &config.target;
    if target.host.is_empty() {
        return Err(ReplayError::Config("target.host is required".into()));
    }
    if target.database.is_empty() {
        return Err(ReplayError::Config("target.database is required".into()));
    }
    if target.user.is_empty() {
        return Err(ReplayError::Config("target.user is required".into()));
    }
    match target.r#type.as_str() {
        "postgres" => {
            SslMode::parse(&target.ssl_mode)?;
        }
        "mysql" => {}
        other => {
            return Err(ReplayError::Config(format!(
                "target.type must be 'postgres' or 'mysql', got '{}'",
                other
            )));
        }
    }

    // Capture validation
    let capture = &config.capture;
    if capture.interval_seconds == 0 {
        return Err(ReplayError::Config(
            "capture.interval_seconds must be at least 1".into(),
        ));
    }
    if capture.limit_per_interval == 0 {
        return Err(ReplayError::Config(
            "capture.limit_per_interval must be at least 1".into(),
        ));
    }
    validate_filters("capture.schemas", &capture.schemas)?;
    validate_filters("capture.modules", &capture.modules)?;

    // Replay validation
    let replay = &config.replay;
    if replay.concurrency == 0 {
        return Err(ReplayError::Config(
            "replay.concurrency must be at least 1".into(),
        ));
    }
    if replay.iterations == 0 {
        return Err(ReplayError::Config(
            "replay.iterations must be at least 1".into(),
        ));
    }
    if let Some(0) = replay.attempt_timeout_ms {
        return Err(ReplayError::Config(
            "replay.attempt_timeout_ms must be at least 1".into(),
        ));
    }
    if replay.handoff_file.trim().is_empty() {
        return Err(ReplayError::Config(
            "replay.handoff_file must not be empty".into(),
        ));
    }
    match replay.baseline {
        BaselineMode::File if replay.baseline_file.is_none() => {
            return Err(ReplayError::Config(
                "replay.baseline is 'file' but replay.baseline_file is not set".into(),
            ));
        }
        BaselineMode::Online if config.source.is_none() => {
            return Err(ReplayError::Config(
                "replay.baseline is 'online' but no source database is configured".into(),
            ));
        }
        _ => {}
    }

    Ok(())
}

/// Filter entries must be non-blank; an empty list means "no filter".
pub fn validate_filters(name: &str, entries: &[String]) -> Result<()> {
    if let Some(pos) = entries.iter().position(|e| e.trim().is_empty()) {
        return Err(ReplayError::Config(format!(
            "{}[{}] must not be blank",
            name, pos
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureConfig, ReplayConfig, SourceConfig, TargetConfig};

    fn valid_config() -> Config {
        Config {
            source: Some(SourceConfig {
                r#type: "mssql".to_string(),
                host: "localhost".to_string(),
                port: Some(1433),
                database: "source_db".to_string(),
                user: "sa".to_string(),
                password: "password".to_string(),
                encrypt: "false".to_string(),
                trust_server_cert: true,
                ssl_mode: "require".to_string(),
            }),
            target: TargetConfig {
                r#type: "postgres".to_string(),
                host: "localhost".to_string(),
                port: Some(5432),
                database: "target_db".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                ssl_mode: "disable".to_string(),
                connect_timeout_seconds: 15,
            },
            capture: CaptureConfig::default(),
            replay: ReplayConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_target_host() {
        let mut config = valid_config();
        config.target.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_source_type() {
        let mut config = valid_config();
        if let Some(source) = config.source.as_mut() {
            source.r#type = "oracle".to_string();
        }
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_target_type() {
        let mut config = valid_config();
        config.target.r#type = "mssql".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.target.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_concurrency_and_iterations() {
        let mut config = valid_config();
        config.replay.concurrency = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.replay.iterations = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_blank_filter_rejected() {
        let mut config = valid_config();
        config.capture.schemas = vec!["SALES".into(), "  ".into()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("capture.schemas[1]"));
    }

    #[test]
    fn test_file_baseline_requires_path() {
        let mut config = valid_config();
        config.replay.baseline = BaselineMode::File;
        assert!(validate(&config).is_err());
        config.replay.baseline_file = Some("baseline.json".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_online_baseline_requires_source() {
        let mut config = valid_config();
        config.source = None;
        config.replay.baseline = BaselineMode::Online;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        if let Some(source) = config.source.as_mut() {
            source.password = "super_secret_password_123".to_string();
        }
        let debug_output = format!("{:?}", config.source);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }

    #[test]
    fn test_target_config_debug_redacts_password() {
        let mut config = valid_config();
        config.target.password = "super_secret_password_456".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_456"));
    }
}
