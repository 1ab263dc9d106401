//! Read access to the billing processor's subscription records.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use super::event::SubscriptionObject;
use super::{ReconcileError, ReconcileResult};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

#[async_trait]
pub trait BillingGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch a subscription by its external id. `None` if the processor does
    /// not know it.
    async fn retrieve_subscription(&self, external_id: &str) -> ReconcileResult<Option<SubscriptionObject>>;
}

#[derive(Clone)]
pub struct StripeGatewayConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout: Duration,
}

impl StripeGatewayConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            base_url: STRIPE_API_BASE.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for StripeGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGatewayConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct StripeGateway {
    http: reqwest::Client,
    config: StripeGatewayConfig,
}

impl StripeGateway {
    pub fn new(config: StripeGatewayConfig) -> ReconcileResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ReconcileError::Gateway(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl BillingGateway for StripeGateway {
    fn name(&self) -> &str {
        "stripe"
    }

    async fn retrieve_subscription(&self, external_id: &str) -> ReconcileResult<Option<SubscriptionObject>> {
        let url = format!(
            "{}/v1/subscriptions/{}",
            self.config.base_url.trim_end_matches('/'),
            external_id
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| ReconcileError::Gateway(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<SubscriptionObject>()
                .await
                .map(Some)
                .map_err(|e| ReconcileError::Gateway(format!("undecodable subscription: {}", e))),
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), body = %body, "Billing gateway request failed");
                Err(ReconcileError::Gateway(format!(
                    "subscription lookup returned {}",
                    status.as_u16()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> StripeGateway {
        StripeGateway::new(
            StripeGatewayConfig::new(SecretString::from("sk_test")).with_base_url(server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_retrieve_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/subscriptions/sub_1"))
            .and(header("authorization", "Bearer sk_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1",
                "status": "active",
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
                "items": {"data": [{"price": {"id": "price_pro_monthly"}}]},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sub = gateway(&server).retrieve_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(sub.status, "active");
        assert_eq!(sub.price_ref(), Some("price_pro_monthly"));
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(gateway(&server).retrieve_subscription("sub_x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = gateway(&server).retrieve_subscription("sub_1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
