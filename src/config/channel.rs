// src/config/channel.rs
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";

fn env_marker() -> String {
    "ENV".to_string()
}
fn default_timeout_secs() -> u64 {
    15
}
fn default_retries() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    /// "ENV" means: read from TELEGRAM_TOKEN
    #[serde(default = "env_marker")]
    pub token: String,
    /// "ENV" means: read from TELEGRAM_CHAT_ID
    #[serde(default = "env_marker")]
    pub chat_id: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per message (rate limits and connect errors only).
    #[serde(default = "default_retries")]
    pub retries: u8,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: env_marker(),
            chat_id: env_marker(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("token", &"***")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

fn resolve_one(
    value: &str,
    var: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let v = value.trim();
    let resolved = if v.eq_ignore_ascii_case("env") {
        lookup(var).unwrap_or_default()
    } else {
        v.to_string()
    };
    let resolved = resolved.trim().to_string();
    if resolved.is_empty() {
        return Err(ConfigError::Missing(var));
    }
    Ok(resolved)
}

impl TelegramConfig {
    /// Resolve "ENV" markers against the process environment.
    pub fn credentials(&self) -> Result<TelegramCredentials, ConfigError> {
        self.credentials_with(|k| std::env::var(k).ok())
    }

    pub fn credentials_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<TelegramCredentials, ConfigError> {
        Ok(TelegramCredentials {
            token: resolve_one(&self.token, ENV_TELEGRAM_TOKEN, &lookup)?,
            chat_id: resolve_one(&self.chat_id, ENV_TELEGRAM_CHAT_ID, &lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| m.get(k).cloned()
    }

    #[test]
    fn env_markers_resolve_from_lookup() {
        let cfg = TelegramConfig::default();
        let creds = cfg
            .credentials_with(env(&[(ENV_TELEGRAM_TOKEN, "123:abc"), (ENV_TELEGRAM_CHAT_ID, "-100")]))
            .unwrap();
        assert_eq!(creds.token, "123:abc");
        assert_eq!(creds.chat_id, "-100");
    }

    #[test]
    fn literal_values_are_kept() {
        let cfg = TelegramConfig {
            token: " t ".into(),
            chat_id: "42".into(),
            ..TelegramConfig::default()
        };
        let creds = cfg.credentials_with(env(&[])).unwrap();
        assert_eq!(creds.token, "t");
    }

    #[test]
    fn missing_env_is_named() {
        let cfg = TelegramConfig::default();
        let err = cfg
            .credentials_with(env(&[(ENV_TELEGRAM_TOKEN, "x")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ENV_TELEGRAM_CHAT_ID)));
    }

    #[test]
    fn debug_hides_token() {
        let c = TelegramCredentials {
            token: "secret".into(),
            chat_id: "1".into(),
        };
        assert!(!format!("{c:?}").contains("secret"));
    }
}
