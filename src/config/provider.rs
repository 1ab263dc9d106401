//! Configuration provider trait.

use std::str::FromStr;

use serde::{Serialize, de::DeserializeOwned};

use super::{ConfigError, ConfigResult};

/// A source of dotted-key configuration values (`billing.webhook_secret`).
#[async_trait::async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;

    async fn set_raw(&self, key: &str, value: &str) -> ConfigResult<()>;

    async fn delete(&self, key: &str) -> ConfigResult<bool>;

    /// Keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>>;
}

/// Typed access on top of [`ConfigProvider`].
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a JSON-encoded value.
    fn get<T: DeserializeOwned + Send>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
    {
        async move {
            match self.get_raw(key).await? {
                Some(raw) => serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| ConfigError::invalid(key, e.to_string())),
                None => Ok(None),
            }
        }
    }

    /// Get a value parsed with [`FromStr`]. Surrounding whitespace and JSON
    /// string quotes are stripped first, so `8080`, `"8080"` and `" 8080 "`
    /// all parse.
    fn get_parsed<T>(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<T>>> + Send
    where
        Self: Sync,
        T: FromStr + Send,
        T::Err: std::fmt::Display,
    {
        async move {
            let Some(raw) = self.get_raw(key).await? else {
                return Ok(None);
            };
            let trimmed = unquote(raw.trim());
            trimmed
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::invalid(key, format!("{:?}: {}", trimmed, e)))
        }
    }

    /// Like [`get_parsed`](Self::get_parsed), with a fallback.
    fn get_or<T>(
        &self,
        key: &str,
        default: T,
    ) -> impl std::future::Future<Output = ConfigResult<T>> + Send
    where
        Self: Sync,
        T: FromStr + Send,
        T::Err: std::fmt::Display,
    {
        async move { Ok(self.get_parsed(key).await?.unwrap_or(default)) }
    }

    /// A non-empty string value.
    fn get_string(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = ConfigResult<Option<String>>> + Send
    where
        Self: Sync,
    {
        async move {
            Ok(self
                .get_raw(key)
                .await?
                .map(|raw| unquote(raw.trim()).to_string())
                .filter(|s| !s.is_empty()))
        }
    }

    fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> impl std::future::Future<Output = ConfigResult<()>> + Send
    where
        Self: Sync,
    {
        async move {
            let raw = serde_json::to_string(value)?;
            self.set_raw(key, &raw).await
        }
    }
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigProvider;

    #[tokio::test]
    async fn test_get_parsed_accepts_quoted_and_bare() {
        let provider = MemoryConfigProvider::new()
            .value("a", "8080")
            .value("b", "\"8080\"")
            .value("c", " true ");

        assert_eq!(provider.get_parsed::<u16>("a").await.unwrap(), Some(8080));
        assert_eq!(provider.get_parsed::<u16>("b").await.unwrap(), Some(8080));
        assert_eq!(provider.get_parsed::<bool>("c").await.unwrap(), Some(true));
        assert_eq!(provider.get_parsed::<u16>("missing").await.unwrap(), None);
        assert_eq!(provider.get_or("missing", 7u16).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_get_parsed_reports_key() {
        let provider = MemoryConfigProvider::new().value("quota.reset_period_days", "thirty");
        let err = provider
            .get_parsed::<u32>("quota.reset_period_days")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota.reset_period_days"));
    }

    #[tokio::test]
    async fn test_get_string_skips_empty() {
        let provider = MemoryConfigProvider::new()
            .value("database.url", "")
            .value("auth.tenant_header", "\"x-user\"");
        assert_eq!(provider.get_string("database.url").await.unwrap(), None);
        assert_eq!(
            provider.get_string("auth.tenant_header").await.unwrap().as_deref(),
            Some("x-user")
        );
    }

    #[tokio::test]
    async fn test_typed_json_roundtrip() {
        let provider = MemoryConfigProvider::new();
        provider.set("tokens.pro", &250u32).await.unwrap();
        let pro: Option<u32> = ConfigProviderExt::get(&provider, "tokens.pro").await.unwrap();
        assert_eq!(pro, Some(250));
    }
}
