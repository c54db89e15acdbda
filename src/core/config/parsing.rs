use std::env;

use super::types::{ConfigError, CronAt, Environment, StoreBackend, SubmissionMethod, TokenLocation};

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| clean_value(&value))
        .filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn env_flag(key: &str) -> Option<bool> {
    env_optional(key).map(|value| parse_bool(&value))
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_i64(field: &'static str, value: String) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_store_backend(value: &str) -> Result<StoreBackend, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
        "memory" => Ok(StoreBackend::Memory),
        _ => Err(ConfigError::InvalidValue { field: "CS_STORE", value: value.to_string() }),
    }
}

pub(super) fn parse_token_location(value: &str) -> Result<TokenLocation, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "env" => Ok(TokenLocation::Env),
        "redis" => Ok(TokenLocation::Redis),
        "file" => Ok(TokenLocation::File),
        _ => Err(ConfigError::InvalidValue { field: "token_location", value: value.to_string() }),
    }
}

pub(super) fn parse_submission_method(value: &str) -> Result<SubmissionMethod, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "display" => Ok(SubmissionMethod::Display),
        "grader_post" => Ok(SubmissionMethod::GraderPost),
        _ => Err(ConfigError::InvalidValue { field: "submission.method", value: value.to_string() }),
    }
}

/// Parses a wall-clock `HH:MM`.
pub(super) fn parse_cron_at(value: &str) -> Result<CronAt, ConfigError> {
    let invalid = || ConfigError::InvalidValue { field: "cron_at", value: value.to_string() };

    let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u8 = hour.trim().parse().map_err(|_| invalid())?;
    let minute: u8 = minute.trim().parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }

    Ok(CronAt { hour, minute })
}

/// Negative limits mean "run forever".
pub(super) fn parse_cron_limit(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

// Provisioning tools sometimes leave surrounding quotes on injected values.
fn clean_value(value: &str) -> String {
    value.trim().trim_matches('"').trim_matches('\'').trim().to_string()
}
