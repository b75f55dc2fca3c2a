//! Engine-wide defaults.
//!
//! A [`Config`] decides how raw input is treated before casting and how
//! strict required-field checks are. Individual calls take [`CastOptions`]
//! or [`RequiredOptions`], both of which can be derived from a `Config`.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::env;

/// Which raw inputs collapse to `nil` before they reach the type caster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyValues {
    /// Every input is cast as given.
    None,
    /// Only the empty string counts as empty.
    Empty,
    /// Strings that are empty after trimming whitespace count as empty.
    #[default]
    Trimmed,
}

impl EmptyValues {
    /// Returns `true` if `value` should be treated as `nil`.
    pub fn is_empty(&self, value: &Value) -> bool {
        match (self, value) {
            (EmptyValues::None, _) => false,
            (EmptyValues::Empty, Value::String(s)) => s.is_empty(),
            (EmptyValues::Trimmed, Value::String(s)) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl std::str::FromStr for EmptyValues {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(EmptyValues::None),
            "empty" => Ok(EmptyValues::Empty),
            "trimmed" => Ok(EmptyValues::Trimmed),
            other => Err(ConfigError::InvalidEmptyValues(other.to_string())),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raw inputs that cast to `nil`
    pub empty_values: EmptyValues,
    /// Whether whitespace-only strings are blank for `validate_required`
    pub trim_required: bool,
    /// Record changes even when the new value equals the current one
    pub force_changes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            empty_values: EmptyValues::Trimmed,
            trim_required: true,
            force_changes: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to [`Config::default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let empty_values = match env::var("CHANGESET_EMPTY_VALUES") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.empty_values,
        };

        let trim_required = bool_var("CHANGESET_TRIM_REQUIRED", defaults.trim_required)?;
        let force_changes = bool_var("CHANGESET_FORCE_CHANGES", defaults.force_changes)?;

        Ok(Self {
            empty_values,
            trim_required,
            force_changes,
        })
    }
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidBool { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid CHANGESET_EMPTY_VALUES value `{0}` (expected none, empty or trimmed)")]
    InvalidEmptyValues(String),

    #[error("invalid {name} value `{value}` (expected true or false)")]
    InvalidBool { name: &'static str, value: String },
}

/// Options for a single `cast` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastOptions {
    pub empty_values: EmptyValues,
    pub force_changes: bool,
    /// Replaces the default "is invalid" message on cast errors
    pub message: Option<String>,
}

impl Default for CastOptions {
    fn default() -> Self {
        CastOptions::from(&Config::default())
    }
}

impl From<&Config> for CastOptions {
    fn from(config: &Config) -> Self {
        Self {
            empty_values: config.empty_values,
            force_changes: config.force_changes,
            message: None,
        }
    }
}

/// Options for `validate_required`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredOptions {
    /// Replaces the default "can't be blank" message
    pub message: Option<String>,
    /// Whitespace-only strings are blank
    pub trim: bool,
}

impl Default for RequiredOptions {
    fn default() -> Self {
        RequiredOptions::from(&Config::default())
    }
}

impl From<&Config> for RequiredOptions {
    fn from(config: &Config) -> Self {
        Self {
            message: None,
            trim: config.trim_required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_modes() {
        let blank = Value::from("   ");
        let empty = Value::from("");

        assert!(!EmptyValues::None.is_empty(&empty));
        assert!(EmptyValues::Empty.is_empty(&empty));
        assert!(!EmptyValues::Empty.is_empty(&blank));
        assert!(EmptyValues::Trimmed.is_empty(&blank));
        assert!(!EmptyValues::Trimmed.is_empty(&Value::Integer(0)));
    }

    #[test]
    fn parse_empty_values() {
        assert_eq!("none".parse::<EmptyValues>(), Ok(EmptyValues::None));
        assert_eq!(
            "sometimes".parse::<EmptyValues>(),
            Err(ConfigError::InvalidEmptyValues("sometimes".into()))
        );
    }

    #[test]
    fn options_follow_config() {
        let config = Config {
            empty_values: EmptyValues::None,
            trim_required: false,
            force_changes: true,
        };

        let cast = CastOptions::from(&config);
        assert_eq!(cast.empty_values, EmptyValues::None);
        assert!(cast.force_changes);

        let required = RequiredOptions::from(&config);
        assert!(!required.trim);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"force_changes": true}"#).unwrap();
        assert!(config.force_changes);
        assert_eq!(config.empty_values, EmptyValues::Trimmed);
        assert!(config.trim_required);
    }
}
