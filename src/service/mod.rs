//! The metering service: every component wired once per process.
//!
//! Handlers receive a shared [`MeteringService`] and never construct
//! storage clients or providers of their own.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use tracing::info;

use crate::admission::{AdmissionController, AdmissionResult, CostPolicy, Metered};
use crate::billing::{
    BillingGateway, BillingReconciler, ReconcileError, ReconcileOutcome, ReconcileResult,
    SignatureVerifier, StripeGateway, StripeGatewayConfig, Subscription,
};
use crate::config::Settings;
use crate::entitlements::{CapabilityRegistry, EntitlementResolver, PlanEntitlements};
use crate::ledger::{LedgerEntry, QuotaLedger};
use crate::observability::{MetricsRegistry, MetricsSummary};
use crate::plans::{Plan, PlanCatalog};
use crate::provider::{
    AudioOpProvider, DisabledProvider, ElevenLabsConfig, ElevenLabsProvider, OperationRequest,
};
use crate::store::{MemoryStore, Store, StoreResult, SubscriptionRepository};
use crate::types::{SharedClock, TenantId, system_clock};
use crate::usage::{HistoryPeriod, UsageLog, UsageRecord};
use crate::voices::{VoiceClone, VoiceRegistry};

/// The tenant's active subscription joined with its plan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub plan: Plan,
}

/// Everything the usage page shows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageOverview {
    pub plan: Plan,
    pub entries: Vec<LedgerEntry>,
    pub period: HistoryPeriod,
    pub history: Vec<UsageRecord>,
    pub subscription: Option<Subscription>,
}

#[derive(Clone)]
pub struct MeteringService {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    ledger: QuotaLedger,
    usage: UsageLog,
    voices: VoiceRegistry,
    entitlements: Arc<EntitlementResolver>,
    admission: AdmissionController,
    reconciler: Option<BillingReconciler>,
    provider: Arc<dyn AudioOpProvider>,
    metrics: Arc<MetricsRegistry>,
}

impl MeteringService {
    pub fn builder(store: Arc<dyn Store>) -> MeteringServiceBuilder {
        MeteringServiceBuilder::new(store)
    }

    /// Wire the service from settings over an already opened store.
    pub fn from_settings(settings: &Settings, store: Arc<dyn Store>) -> crate::Result<Self> {
        let mut builder = Self::builder(store)
            .catalog(PlanCatalog::builtin(settings.tokens)?)
            .reset_period(settings.quota.reset_period())
            .provider_timeout(settings.provider.timeout)
            .audit_rejections(settings.quota.audit_rejections);

        if let Some(key) = &settings.provider.api_key {
            let config = ElevenLabsConfig::new(key.clone())
                .with_base_url(settings.provider.base_url.clone())
                .with_timeout(settings.provider.timeout);
            builder = builder.provider(Arc::new(ElevenLabsProvider::new(config)?));
        }
        if let Some(secret) = &settings.billing.webhook_secret {
            let tolerance =
                chrono::Duration::seconds(settings.billing.signature_tolerance_secs as i64);
            builder = builder.webhook_secret(secret.clone(), tolerance);
        }
        if let Some(key) = &settings.billing.api_key {
            let config =
                StripeGatewayConfig::new(key.clone()).with_base_url(settings.billing.api_base.clone());
            builder = builder.gateway(Arc::new(StripeGateway::new(config)?));
        }
        Ok(builder.build())
    }

    /// Run one metered operation with the configured provider.
    pub async fn execute(
        &self,
        tenant: &TenantId,
        request: OperationRequest,
    ) -> AdmissionResult<Metered> {
        self.admission
            .execute(tenant, request, self.provider.clone())
            .await
    }

    pub async fn usage_overview(
        &self,
        tenant: &TenantId,
        period: HistoryPeriod,
    ) -> StoreResult<UsageOverview> {
        Ok(UsageOverview {
            plan: self.ledger.current_plan(tenant).await?,
            entries: self.ledger.snapshot(tenant).await?,
            period,
            history: self.usage.history(tenant, period).await?,
            subscription: self.store.current_subscription(tenant).await?,
        })
    }

    /// `None` for tenants on the free plan.
    pub async fn subscription(&self, tenant: &TenantId) -> StoreResult<Option<SubscriptionView>> {
        let Some(subscription) = self.store.current_subscription(tenant).await? else {
            return Ok(None);
        };
        let plan = self.ledger.current_plan(tenant).await?;
        Ok(Some(SubscriptionView { subscription, plan }))
    }

    pub async fn entitlements(&self, tenant: &TenantId) -> StoreResult<PlanEntitlements> {
        let plan = self.ledger.current_plan(tenant).await?;
        Ok(self.entitlements.entitlements_for(&plan.id))
    }

    pub async fn list_voice_clones(&self, tenant: &TenantId) -> StoreResult<Vec<VoiceClone>> {
        self.voices.list(tenant).await
    }

    /// Look a clone up by provider voice id, polling the provider while it
    /// is still training.
    pub async fn voice_clone(
        &self,
        tenant: &TenantId,
        voice_id: &str,
    ) -> StoreResult<Option<VoiceClone>> {
        if self.voices.find_by_voice(tenant, voice_id).await?.is_none() {
            return Ok(None);
        }
        self.voices
            .refresh(tenant, voice_id, self.provider.as_ref())
            .await
            .map(Some)
    }

    pub async fn delete_voice_clone(&self, tenant: &TenantId, voice_id: &str) -> StoreResult<bool> {
        self.voices.delete(tenant, voice_id).await
    }

    /// Erase the tenant's usage history. Nothing else deletes usage rows.
    pub async fn delete_tenant_usage(&self, tenant: &TenantId) -> StoreResult<u64> {
        self.usage.delete_for_tenant(tenant).await
    }

    pub fn webhooks_enabled(&self) -> bool {
        self.reconciler.is_some()
    }

    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ReconcileResult<ReconcileOutcome> {
        match &self.reconciler {
            Some(reconciler) => reconciler.handle_webhook(payload, signature).await,
            None => Err(ReconcileError::invalid("billing webhooks are not configured")),
        }
    }

    pub fn reconciler(&self) -> Option<&BillingReconciler> {
        self.reconciler.as_ref()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn metrics(&self) -> MetricsSummary {
        MetricsSummary::from_registry(&self.metrics)
    }

    pub async fn shutdown(&self) {
        info!(store = self.store.name(), "Closing store");
        self.store.close().await;
    }
}

impl std::fmt::Debug for MeteringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringService")
            .field("store", &self.store.name())
            .field("provider", &self.provider.name())
            .field("plans", &self.catalog.len())
            .field("webhooks", &self.webhooks_enabled())
            .finish()
    }
}

/// Open the store named by the settings: Postgres when a URL is set,
/// memory otherwise.
pub async fn open_store(settings: &Settings) -> crate::Result<Arc<dyn Store>> {
    match &settings.database.url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            use secrecy::ExposeSecret;

            let config = crate::store::PgPoolConfig {
                max_connections: settings.database.max_connections,
                ..Default::default()
            };
            let store = crate::store::PostgresStore::connect(url.expose_secret(), config).await?;
            store.migrate().await?;
            info!("Using postgres store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => Err(crate::Error::Config(crate::config::ConfigError::invalid(
            "database.url",
            "built without the `postgres` feature",
        ))),
        None => {
            info!("No database.url set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub struct MeteringServiceBuilder {
    store: Arc<dyn Store>,
    catalog: Option<Arc<PlanCatalog>>,
    capabilities: CapabilityRegistry,
    clock: SharedClock,
    provider: Arc<dyn AudioOpProvider>,
    cost_policy: Option<Arc<dyn CostPolicy>>,
    metrics: Arc<MetricsRegistry>,
    reset_period: Option<chrono::Duration>,
    provider_timeout: Option<Duration>,
    audit_rejections: bool,
    webhook: Option<(SecretString, chrono::Duration)>,
    gateway: Option<Arc<dyn BillingGateway>>,
}

impl MeteringServiceBuilder {
    fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            catalog: None,
            capabilities: CapabilityRegistry::with_defaults(),
            clock: system_clock(),
            provider: Arc::new(DisabledProvider),
            cost_policy: None,
            metrics: Arc::new(MetricsRegistry::default()),
            reset_period: None,
            provider_timeout: None,
            audit_rejections: false,
            webhook: None,
            gateway: None,
        }
    }

    pub fn catalog(mut self, catalog: PlanCatalog) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = registry;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn AudioOpProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn cost_policy(mut self, policy: Arc<dyn CostPolicy>) -> Self {
        self.cost_policy = Some(policy);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn reset_period(mut self, period: chrono::Duration) -> Self {
        self.reset_period = Some(period);
        self
    }

    pub fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = Some(timeout);
        self
    }

    pub fn audit_rejections(mut self, enabled: bool) -> Self {
        self.audit_rejections = enabled;
        self
    }

    /// Enables the billing reconciler.
    pub fn webhook_secret(mut self, secret: SecretString, tolerance: chrono::Duration) -> Self {
        self.webhook = Some((secret, tolerance));
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn BillingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn build(self) -> MeteringService {
        let catalog = self.catalog.unwrap_or_default();
        let store = self.store;
        let clock = self.clock;

        let mut ledger = QuotaLedger::new(store.clone(), catalog.clone(), clock.clone());
        if let Some(period) = self.reset_period {
            ledger = ledger.with_reset_period(period);
        }
        let usage = UsageLog::new(store.clone(), clock.clone());
        let voices = VoiceRegistry::new(store.clone(), clock.clone());
        let entitlements = Arc::new(EntitlementResolver::new(catalog.clone(), self.capabilities));

        let mut admission = AdmissionController::new(
            ledger.clone(),
            usage.clone(),
            voices.clone(),
            entitlements.clone(),
        )
        .with_metrics(self.metrics.clone())
        .audit_rejections(self.audit_rejections);
        if let Some(policy) = self.cost_policy {
            admission = admission.with_cost_policy(policy);
        }
        if let Some(timeout) = self.provider_timeout {
            admission = admission.with_provider_timeout(timeout);
        }

        let reconciler = self.webhook.map(|(secret, tolerance)| {
            let verifier = SignatureVerifier::new(secret, clock.clone()).with_tolerance(tolerance);
            let reconciler = BillingReconciler::new(
                store.clone(),
                ledger.clone(),
                catalog.clone(),
                verifier,
                clock.clone(),
            )
            .with_metrics(self.metrics.clone());
            match self.gateway {
                Some(gateway) => reconciler.with_gateway(gateway),
                None => reconciler,
            }
        });

        MeteringService {
            store,
            catalog,
            ledger,
            usage,
            voices,
            entitlements,
            admission,
            reconciler,
            provider: self.provider,
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::QualityTier;
    use crate::provider::{CloneParams, ScriptedProvider, SpeechParams};
    use crate::types::ManualClock;
    use bytes::Bytes;
    use chrono::Utc;

    fn service() -> MeteringService {
        MeteringService::builder(Arc::new(MemoryStore::new()))
            .clock(Arc::new(ManualClock::new(Utc::now())))
            .provider(Arc::new(ScriptedProvider::new()))
            .build()
    }

    fn speech() -> OperationRequest {
        OperationRequest::TextToSpeech(SpeechParams {
            text: "Hello".into(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".into(),
            quality: QualityTier::Standard,
            language: "en".into(),
        })
    }

    #[tokio::test]
    async fn test_execute_and_overview() {
        let service = service();
        let tenant = TenantId::from("t1");

        let metered = service.execute(&tenant, speech()).await.unwrap();
        assert_eq!(metered.reservation.tokens_remaining(), 24);

        let overview = service.usage_overview(&tenant, HistoryPeriod::Month).await.unwrap();
        assert!(overview.plan.id.is_free());
        assert_eq!(overview.entries.len(), 3);
        assert_eq!(overview.history.len(), 1);
        assert!(overview.subscription.is_none());
        assert!(service.subscription(&tenant).await.unwrap().is_none());
        assert_eq!(service.metrics().reservations_granted, 1);
    }

    #[tokio::test]
    async fn test_disabled_provider_refunds() {
        let service = MeteringService::builder(Arc::new(MemoryStore::new())).build();
        let tenant = TenantId::from("t1");

        let err = service.execute(&tenant, speech()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::admission::AdmissionError::ProviderFailure { refunded: true, .. }
        ));
        let entry = service
            .ledger()
            .get(&tenant, crate::types::OperationClass::Tts)
            .await
            .unwrap();
        assert_eq!(entry.tokens_remaining, 25);
    }

    #[tokio::test]
    async fn test_webhooks_disabled_without_secret() {
        let service = service();
        assert!(!service.webhooks_enabled());
        assert!(matches!(
            service.handle_webhook(b"{}", Some("t=1,v1=00")).await,
            Err(ReconcileError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_free_tenant_cannot_clone_then_voice_lookup() {
        let service = service();
        let tenant = TenantId::from("t1");
        let request = OperationRequest::VoiceClone(CloneParams {
            name: "Mine".into(),
            description: None,
            sample: Bytes::from_static(b"RIFF"),
            filename: "mine.wav".into(),
        });
        assert!(matches!(
            service.execute(&tenant, request).await,
            Err(crate::admission::AdmissionError::EntitlementDenied(_))
        ));
        assert!(service.list_voice_clones(&tenant).await.unwrap().is_empty());
        assert!(service.voice_clone(&tenant, "clone_mine").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_settings_enables_webhooks() {
        let mut settings = Settings::default();
        settings.billing.webhook_secret = Some(SecretString::from("whsec_x"));
        settings.tokens.free = 5;

        let service = MeteringService::from_settings(&settings, Arc::new(MemoryStore::new())).unwrap();
        assert!(service.webhooks_enabled());
        assert_eq!(service.catalog().free().tokens_per_month, 5);
        assert!(open_store(&settings).await.is_ok());
    }
}
