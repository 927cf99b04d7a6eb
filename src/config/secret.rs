//! Redacted strings for notifier credentials.

use std::fmt;

use serde::Deserialize;

use super::env::resolve_env_vars;
use crate::error::ConfigError;

const REDACTED: &str = "[REDACTED]";

/// A credential read from the configuration file.
///
/// Formats as `[REDACTED]` so configs and notifiers can be logged with `{:?}`.
/// The raw value may still hold `${VAR}` references; [`SecretString::resolve`]
/// substitutes them when the notifier is built, so `--validate` never needs
/// the secret in its environment.
///
/// ```
/// use trigwatch::config::SecretString;
///
/// let key = SecretString::from("k-123");
/// assert_eq!(format!("{key:?}"), "[REDACTED]");
/// assert_eq!(key.expose(), "k-123");
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Substitute `${VAR}` references from the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError::ValidationError`] naming every undefined variable.
    pub fn resolve(&self) -> Result<SecretString, ConfigError> {
        resolve_env_vars(&self.0).map(SecretString)
    }

    /// The raw value. Only for building request headers.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}
