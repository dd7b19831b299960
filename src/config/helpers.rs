use std::str::FromStr;

use crate::error::ConfigError;

/// Source of configuration values, keyed by environment variable name.
///
/// Resolution goes through this indirection so tests can feed values without
/// touching the process environment.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read a variable from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Fetch a value, treating empty strings as unset.
pub(crate) fn optional_env(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

/// Parse a value with `FromStr`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(lookup, key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a boolean flag. Accepts `true/false`, `1/0`, `yes/no` and `on/off`.
pub(crate) fn parse_bool_env(lookup: Lookup<'_>, key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = optional_env(lookup, key) else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be 'true' or 'false', got '{other}'"),
        }),
    }
}
