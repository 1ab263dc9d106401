//! Typed service settings resolved from a [`ConfigProvider`].

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderName;
use secrecy::SecretString;

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult, ValidationErrors};
use crate::plans::TokenAllotments;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_TENANT_HEADER: &str = "x-tenant-id";
pub const DEFAULT_BILLING_API_BASE: &str = "https://api.stripe.com";
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.elevenlabs.io";
/// Base64 audio samples dominate request size.
pub const DEFAULT_BODY_LIMIT_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Absent means the in-memory store.
    pub url: Option<SecretString>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// The webhook route is only mounted when this is set.
    pub webhook_secret: Option<SecretString>,
    pub signature_tolerance_secs: u64,
    pub api_key: Option<SecretString>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSettings {
    pub reset_period_days: u32,
    pub audit_rejections: bool,
}

impl QuotaSettings {
    pub fn reset_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.reset_period_days))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub tenant_header: HeaderName,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub billing: BillingSettings,
    pub provider: ProviderSettings,
    pub quota: QuotaSettings,
    pub tokens: TokenAllotments,
    pub auth: AuthSettings,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
                body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
            },
            database: DatabaseSettings {
                url: None,
                max_connections: 10,
            },
            billing: BillingSettings {
                webhook_secret: None,
                signature_tolerance_secs: crate::billing::DEFAULT_TOLERANCE_SECS as u64,
                api_key: None,
                api_base: DEFAULT_BILLING_API_BASE.into(),
            },
            provider: ProviderSettings {
                api_key: None,
                base_url: DEFAULT_PROVIDER_BASE_URL.into(),
                timeout: crate::admission::DEFAULT_PROVIDER_TIMEOUT,
            },
            quota: QuotaSettings {
                reset_period_days: 30,
                audit_rejections: false,
            },
            tokens: TokenAllotments::default(),
            auth: AuthSettings {
                tenant_header: HeaderName::from_static(DEFAULT_TENANT_HEADER),
            },
            log_json: false,
        }
    }
}

/// Accumulates every invalid key instead of stopping at the first.
struct Loader<'a> {
    config: &'a dyn ConfigProvider,
    errors: Vec<ConfigError>,
}

impl Loader<'_> {
    async fn parsed<T>(&mut self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Send,
        T::Err: std::fmt::Display,
    {
        match self.config.get_parsed(key).await {
            Ok(value) => value.unwrap_or(default),
            Err(e) => {
                self.errors.push(e);
                default
            }
        }
    }

    async fn positive<T>(&mut self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Send + Default + PartialEq + Copy,
        T::Err: std::fmt::Display,
    {
        let value = self.parsed(key, default).await;
        if value == T::default() {
            self.errors.push(ConfigError::invalid(key, "must be greater than zero"));
            return default;
        }
        value
    }

    async fn string(&mut self, key: &str) -> Option<String> {
        match self.config.get_string(key).await {
            Ok(value) => value,
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    async fn secret(&mut self, key: &str) -> Option<SecretString> {
        self.string(key).await.map(SecretString::from)
    }
}

impl Settings {
    /// Resolve every key, falling back to defaults. All invalid values are
    /// reported in one error.
    pub async fn load(config: &dyn ConfigProvider) -> ConfigResult<Self> {
        let defaults = Self::default();
        let mut l = Loader {
            config,
            errors: Vec::new(),
        };

        let server = ServerSettings {
            bind: l.parsed("server.bind", defaults.server.bind).await,
            body_limit_bytes: l
                .positive("server.body_limit_bytes", defaults.server.body_limit_bytes)
                .await,
        };
        let database = DatabaseSettings {
            url: l.secret("database.url").await,
            max_connections: l
                .positive("database.max_connections", defaults.database.max_connections)
                .await,
        };
        let billing = BillingSettings {
            webhook_secret: l.secret("billing.webhook_secret").await,
            signature_tolerance_secs: l
                .positive(
                    "billing.signature_tolerance_secs",
                    defaults.billing.signature_tolerance_secs,
                )
                .await,
            api_key: l.secret("billing.api_key").await,
            api_base: l
                .string("billing.api_base")
                .await
                .unwrap_or(defaults.billing.api_base),
        };
        let provider = ProviderSettings {
            api_key: l.secret("provider.api_key").await,
            base_url: l
                .string("provider.base_url")
                .await
                .unwrap_or(defaults.provider.base_url),
            timeout: Duration::from_secs(
                l.positive("provider.timeout_secs", defaults.provider.timeout.as_secs())
                    .await,
            ),
        };
        let quota = QuotaSettings {
            reset_period_days: l
                .positive("quota.reset_period_days", defaults.quota.reset_period_days)
                .await,
            audit_rejections: l
                .parsed("quota.audit_rejections", defaults.quota.audit_rejections)
                .await,
        };
        let tokens = TokenAllotments {
            free: l.positive("tokens.free", defaults.tokens.free).await,
            starter: l.positive("tokens.starter", defaults.tokens.starter).await,
            pro: l.positive("tokens.pro", defaults.tokens.pro).await,
            premium: l.positive("tokens.premium", defaults.tokens.premium).await,
            enterprise: l.positive("tokens.enterprise", defaults.tokens.enterprise).await,
        };
        let tenant_header = match l.string("auth.tenant_header").await {
            Some(raw) => HeaderName::from_bytes(raw.to_ascii_lowercase().as_bytes())
                .unwrap_or_else(|e| {
                    l.errors.push(ConfigError::invalid("auth.tenant_header", e.to_string()));
                    defaults.auth.tenant_header.clone()
                }),
            None => defaults.auth.tenant_header.clone(),
        };
        let log_json = l.parsed("log.json", defaults.log_json).await;

        match l.errors.len() {
            0 => Ok(Self {
                server,
                database,
                billing,
                provider,
                quota,
                tokens,
                auth: AuthSettings { tenant_header },
                log_json,
            }),
            1 => Err(l.errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(l.errors))),
        }
    }
}
