//! Chains configuration providers. Earlier providers win.

use std::collections::BTreeSet;

use super::ConfigResult;
use super::provider::ConfigProvider;

pub struct CompositeConfigProvider {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl CompositeConfigProvider {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// First added = highest priority.
    pub fn add_provider(&mut self, provider: Box<dyn ConfigProvider>) {
        self.providers.push(provider);
    }

    pub fn provider(mut self, provider: Box<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Name of the provider that answers `key`, for startup logging.
    pub async fn source_of(&self, key: &str) -> ConfigResult<Option<&str>> {
        for provider in &self.providers {
            if provider.get_raw(key).await?.is_some() {
                return Ok(Some(provider.name()));
            }
        }
        Ok(None)
    }
}

impl Default for CompositeConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for CompositeConfigProvider {
    fn name(&self) -> &str {
        "composite"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        for provider in &self.providers {
            if let Some(value) = provider.get_raw(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Writes go to the first provider that accepts them; read-only
    /// providers such as the environment are skipped.
    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()> {
        let mut last_err = None;
        for provider in &self.providers {
            match provider.set_raw(key, value).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn delete(&self, key: &str) -> ConfigResult<bool> {
        let mut deleted = false;
        for provider in &self.providers {
            if let Ok(true) = provider.delete(key).await {
                deleted = true;
            }
        }
        Ok(deleted)
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        let mut all = BTreeSet::new();
        for provider in &self.providers {
            all.extend(provider.list_keys(prefix).await?);
        }
        Ok(all.into_iter().collect())
    }
}

impl std::fmt::Debug for CompositeConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeConfigProvider")
            .field("providers", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfigProvider, MemoryConfigProvider};

    fn layered() -> CompositeConfigProvider {
        CompositeConfigProvider::new()
            .provider(Box::new(EnvConfigProvider::from_vars(
                "VOICEMETER_",
                [("VOICEMETER_TOKENS_PRO", "300")],
            )))
            .provider(Box::new(
                MemoryConfigProvider::named("defaults")
                    .value("tokens.pro", "250")
                    .value("tokens.free", "25"),
            ))
    }

    #[tokio::test]
    async fn test_first_provider_wins() {
        let composite = layered();
        assert_eq!(composite.get_raw("tokens.pro").await.unwrap().as_deref(), Some("300"));
        assert_eq!(composite.get_raw("tokens.free").await.unwrap().as_deref(), Some("25"));
        assert_eq!(composite.source_of("tokens.pro").await.unwrap(), Some("env"));
        assert_eq!(composite.source_of("tokens.free").await.unwrap(), Some("defaults"));
        assert_eq!(composite.source_of("tokens.premium").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_skips_read_only_providers() {
        let composite = layered();
        composite.set_raw("log.json", "true").await.unwrap();
        assert_eq!(composite.source_of("log.json").await.unwrap(), Some("defaults"));
    }

    #[tokio::test]
    async fn test_list_keys_merges_and_dedups() {
        let composite = layered();
        assert_eq!(
            composite.list_keys("tokens.").await.unwrap(),
            vec!["tokens.free", "tokens.pro"]
        );
        assert_eq!(composite.provider_names(), vec!["env", "defaults"]);
    }
}
