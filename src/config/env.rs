//! Environment variable configuration provider.
//!
//! `billing.webhook_secret` is read from `VOICEMETER_BILLING_WEBHOOK_SECRET`.

use std::collections::HashMap;

use super::provider::ConfigProvider;
use super::{ConfigError, ConfigResult};

pub const DEFAULT_ENV_PREFIX: &str = "VOICEMETER_";

/// Read-only environment provider.
///
/// Environment variables are treated as immutable at runtime because
/// modifying them is not thread-safe (requires unsafe in Rust 1.80+).
/// Tests use [`EnvConfigProvider::from_vars`] instead of touching the
/// process environment.
#[derive(Debug, Clone)]
pub struct EnvConfigProvider {
    prefix: String,
    vars: Option<HashMap<String, String>>,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: None,
        }
    }

    /// Read from a fixed variable set instead of the process environment.
    pub fn from_vars(
        prefix: impl Into<String>,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            vars: Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }

    fn lookup(&self, name: &str) -> ConfigResult<Option<String>> {
        if let Some(vars) = &self.vars {
            return Ok(vars.get(name).cloned());
        }
        match std::env::var(name) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }

    fn names(&self) -> Vec<String> {
        match &self.vars {
            Some(vars) => vars.keys().cloned().collect(),
            None => std::env::vars().map(|(k, _)| k).collect(),
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for EnvConfigProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        self.lookup(&self.env_key(key))
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

    /// Underscores are ambiguous on the way back, so every `_` after the
    /// prefix becomes a `.`; `DATABASE_MAX_CONNECTIONS` lists as
    /// `database.max.connections`.
    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let env_prefix = self.env_key(prefix);
        Ok(self
            .names()
            .into_iter()
            .filter(|name| name.starts_with(&env_prefix))
            .map(|name| name[self.prefix.len()..].to_lowercase().replace('_', "."))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key_conversion() {
        let provider = EnvConfigProvider::new();
        assert_eq!(
            provider.env_key("billing.webhook_secret"),
            "VOICEMETER_BILLING_WEBHOOK_SECRET"
        );
        assert_eq!(provider.env_key("server.bind"), "VOICEMETER_SERVER_BIND");
    }

    #[tokio::test]
    async fn test_from_vars() {
        let provider = EnvConfigProvider::from_vars(
            "VM_",
            [("VM_TOKENS_PRO", "300"), ("OTHER_TOKENS_PRO", "1")],
        );
        assert_eq!(
            provider.get_raw("tokens.pro").await.unwrap().as_deref(),
            Some("300")
        );
        assert_eq!(provider.list_keys("tokens").await.unwrap(), vec!["tokens.pro"]);
    }

    #[tokio::test]
    async fn test_process_env() {
        let provider = EnvConfigProvider::prefixed("VOICEMETER_TEST_ENV_");

        // SAFETY: test-only variable with a name no other test reads
        unsafe { std::env::set_var("VOICEMETER_TEST_ENV_LOG_JSON", "true") };
        assert_eq!(
            provider.get_raw("log.json").await.unwrap().as_deref(),
            Some("true")
        );
        unsafe { std::env::remove_var("VOICEMETER_TEST_ENV_LOG_JSON") };
        assert_eq!(provider.get_raw("log.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_env_provider_read_only() {
        let provider = EnvConfigProvider::new();
        assert!(provider.set_raw("server.bind", "x").await.is_err());
        assert!(provider.delete("server.bind").await.is_err());
    }
}
