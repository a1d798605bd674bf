//! Environment Variable Configuration Provider
//!
//! Read-only. `schedule.max_concurrency` is looked up as
//! `SU_RECONCILE_SCHEDULE_MAX_CONCURRENCY` under the default prefix.

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

/// Prefix used by [`EnvConfigProvider::default`].
pub const ENV_PREFIX: &str = "SU_RECONCILE_";

/// Read-only environment variable configuration provider.
///
/// Environment variables are treated as immutable at runtime because
/// modifying them is not thread-safe (requires unsafe in Rust 1.80+).
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: Option<String>,
}

impl EnvConfigProvider {
    /// Provider without a prefix
    pub fn unprefixed() -> Self {
        Self { prefix: None }
    }

    /// Create an environment provider with a prefix
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Get the full environment variable name
    fn env_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, key.to_uppercase().replace('.', "_")),
            None => key.to_uppercase().replace('.', "_"),
        }
    }

    /// Reverse: extract key from environment variable name
    fn key_from_env(&self, env_name: &str) -> Option<String> {
        match &self.prefix {
            Some(prefix) => env_name
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.to_lowercase().replace('_', ".")),
            None => Some(env_name.to_lowercase().replace('_', ".")),
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::prefixed(ENV_PREFIX)
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        let env_key = self.env_key(key);
        match std::env::var(&env_key) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }

    async fn set_raw(&self, _key: &str, _value: &str) -> ConfigResult<()> {
        Err(ConfigError::Provider {
            message: "Environment variables are read-only at runtime".into(),
        })
    }

    async fn delete(&self, _key: &str) -> ConfigResult<bool> {
        Err(ConfigError::Provider {
            message: "Environment variables are read-only at runtime".into(),
        })
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let env_prefix = self.env_key(prefix);
        let keys: Vec<String> = std::env::vars()
            .filter_map(|(k, _)| {
                if k.starts_with(&env_prefix) {
                    self.key_from_env(&k)
                } else {
                    None
                }
            })
            .collect();
        Ok(keys)
    }
}
