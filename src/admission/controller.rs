//! Metered execution with reservation and compensation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::cost::{CostPolicy, FlatRateCostPolicy};
use super::{AdmissionError, AdmissionResult};
use crate::entitlements::{Capability, EntitlementResolver};
use crate::ledger::{LedgerEntry, QuotaLedger};
use crate::observability::{
    MetricsRegistry, ProviderCallOutcome, ProviderCallSpan, admission_span,
};
use crate::plans::Plan;
use crate::provider::{
    AudioOpProvider, MAX_TEXT_CHARS, OperationOutput, OperationRequest, ProviderError,
};
use crate::store::{ConsumeOutcome, RetryPolicy, with_retry};
use crate::types::{OperationClass, PlanId, TenantId, Tokens, UsageId};
use crate::usage::{UsageLog, UsageOutcome, UsageRecord};
use crate::voices::{SampleMetadata, VoiceClone, VoiceRegistry};

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// Tokens taken from one ledger row, pending settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub usage_id: UsageId,
    pub tenant_id: TenantId,
    pub operation: OperationClass,
    pub cost: Tokens,
    pub plan_id: PlanId,
    /// Reset date of the ledger cycle the tokens came from.
    pub cycle: DateTime<Utc>,
    /// Ledger row right after the decrement.
    pub entry: LedgerEntry,
}

impl Reservation {
    pub fn tokens_remaining(&self) -> Tokens {
        self.entry.tokens_remaining
    }
}

/// A successful metered operation.
#[derive(Debug, Clone)]
pub struct Metered {
    pub output: OperationOutput,
    pub output_ref: String,
    pub reservation: Reservation,
    /// Set for voice-clone operations.
    pub voice_clone: Option<VoiceClone>,
}

#[derive(Clone)]
pub struct AdmissionController {
    ledger: QuotaLedger,
    usage: UsageLog,
    voices: VoiceRegistry,
    entitlements: Arc<EntitlementResolver>,
    cost_policy: Arc<dyn CostPolicy>,
    metrics: Arc<MetricsRegistry>,
    provider_timeout: Duration,
    audit_rejections: bool,
}

impl AdmissionController {
    pub fn new(
        ledger: QuotaLedger,
        usage: UsageLog,
        voices: VoiceRegistry,
        entitlements: Arc<EntitlementResolver>,
    ) -> Self {
        Self {
            ledger,
            usage,
            voices,
            entitlements,
            cost_policy: Arc::new(FlatRateCostPolicy::default()),
            metrics: Arc::new(MetricsRegistry::default()),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            audit_rejections: false,
        }
    }

    pub fn with_cost_policy(mut self, policy: Arc<dyn CostPolicy>) -> Self {
        self.cost_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// Append a zero-cost `rejected` usage row for every refused
    /// reservation.
    pub fn audit_rejections(mut self, enabled: bool) -> Self {
        self.audit_rejections = enabled;
        self
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn cost_policy(&self) -> &dyn CostPolicy {
        self.cost_policy.as_ref()
    }

    /// Reserve `cost` tokens of `operation` for the tenant.
    pub async fn reserve(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
        cost: Tokens,
    ) -> AdmissionResult<Reservation> {
        let plan = self.ledger.current_plan(tenant).await?;
        let usage = UsageRecord::new(
            tenant.clone(),
            operation,
            cost,
            format!("{} reservation", operation),
            self.ledger.now(),
        );
        self.reserve_usage(&plan, usage).await
    }

    async fn reserve_usage(&self, plan: &Plan, usage: UsageRecord) -> AdmissionResult<Reservation> {
        let tenant = usage.tenant_id.clone();
        let operation = usage.operation;
        let cost = usage.tokens_charged;
        if cost == 0 {
            return Err(AdmissionError::InvalidCost { cost });
        }

        let usage_id = usage.id;
        let audit = self.audit_rejections.then(|| usage.clone().rejected());
        let outcome = self
            .ledger
            .decrement(&tenant, operation, cost, plan.tokens_per_month, usage)
            .await?;

        match outcome {
            ConsumeOutcome::Granted { entry } => {
                self.metrics.record_reservation(true, cost);
                Ok(Reservation {
                    usage_id,
                    tenant_id: tenant,
                    operation,
                    cost,
                    plan_id: plan.id.clone(),
                    cycle: entry.reset_date,
                    entry,
                })
            }
            ConsumeOutcome::Insufficient { entry } => {
                self.metrics.record_reservation(false, cost);
                info!(
                    tenant_id = %tenant,
                    operation = %operation,
                    cost,
                    remaining = entry.tokens_remaining,
                    "Reservation rejected: insufficient tokens"
                );
                if let Some(record) = audit {
                    if let Err(e) = self.usage.append(record).await {
                        warn!(tenant_id = %tenant, error = %e, "Failed to record rejected reservation");
                    }
                }
                Err(AdmissionError::InsufficientTokens {
                    operation,
                    tokens_needed: cost,
                    tokens_remaining: entry.tokens_remaining,
                })
            }
        }
    }

    /// Reverse a reservation. Returns whether the ledger was credited; when
    /// a reset happened in between, only the usage row is settled.
    pub async fn refund(&self, reservation: &Reservation) -> AdmissionResult<bool> {
        let credited = with_retry(RetryPolicy::default(), || {
            self.ledger.increment(
                &reservation.tenant_id,
                reservation.operation,
                reservation.cost,
                reservation.cycle,
                reservation.usage_id,
            )
        })
        .await?;
        if credited {
            self.metrics.record_refund(reservation.cost);
        }
        warn!(
            tenant_id = %reservation.tenant_id,
            operation = %reservation.operation,
            usage_id = %reservation.usage_id,
            cost = reservation.cost,
            credited,
            "Reservation refunded"
        );
        Ok(credited)
    }

    pub async fn commit(&self, reservation: &Reservation, output_ref: Option<String>) -> AdmissionResult<()> {
        self.usage
            .complete(
                &reservation.tenant_id,
                reservation.usage_id,
                UsageOutcome::Succeeded,
                output_ref,
            )
            .await?;
        Ok(())
    }

    /// Settle as failed while keeping the charge.
    async fn keep_charge(&self, reservation: &Reservation) -> AdmissionResult<()> {
        self.usage
            .complete(
                &reservation.tenant_id,
                reservation.usage_id,
                UsageOutcome::Failed,
                None,
            )
            .await?;
        Ok(())
    }

    /// Run one metered operation end to end.
    ///
    /// The provider call happens outside any storage transaction. A definite
    /// provider failure refunds the reservation; a timeout or an uncertain
    /// outcome keeps the charge because the provider may have done the work.
    ///
    /// Once tokens are reserved, the provider call and its settlement run on
    /// their own task: dropping the returned future (a client disconnect)
    /// still commits, refunds or keeps the charge.
    pub async fn execute(
        &self,
        tenant: &TenantId,
        request: OperationRequest,
        provider: Arc<dyn AudioOpProvider>,
    ) -> AdmissionResult<Metered> {
        let span = admission_span(tenant, request.class());
        self.execute_inner(tenant, request, provider)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        tenant: &TenantId,
        request: OperationRequest,
        provider: Arc<dyn AudioOpProvider>,
    ) -> AdmissionResult<Metered> {
        validate(&request)?;
        let plan = self.ledger.current_plan(tenant).await?;
        self.check_entitlements(tenant, &plan, &request).await?;

        let operation = request.class();
        let cost = self.cost_policy.cost(&request);
        let usage = UsageRecord::new(
            tenant.clone(),
            operation,
            cost,
            request.input_descriptor(),
            self.ledger.now(),
        )
        .with_voice(request.voice_id().map(String::from))
        .with_metadata(request.metadata());
        let reservation = self.reserve_usage(&plan, usage).await?;

        let span = Span::current();
        span.record("cost", cost);
        span.record("usage_id", tracing::field::display(reservation.usage_id));

        let usage_id = reservation.usage_id;
        let this = self.clone();
        let owner = tenant.clone();
        let settled = tokio::spawn(
            async move {
                this.run_reserved(&owner, request, provider.as_ref(), reservation)
                    .await
            }
            .instrument(span),
        );
        match settled.await {
            Ok(result) => result,
            Err(e) => {
                error!(tenant_id = %tenant, usage_id = %usage_id, error = %e, "Settlement task failed");
                Err(AdmissionError::ProviderFailure {
                    message: "provider call aborted".into(),
                    refunded: false,
                })
            }
        }
    }

    /// Call the provider for a granted reservation and settle it.
    async fn run_reserved(
        &self,
        tenant: &TenantId,
        request: OperationRequest,
        provider: &dyn AudioOpProvider,
        reservation: Reservation,
    ) -> AdmissionResult<Metered> {
        let operation = reservation.operation;
        let call = ProviderCallSpan::new(provider.name(), operation);
        self.metrics.record_provider_start();
        let result = match tokio::time::timeout(self.provider_timeout, provider.run(&request))
            .instrument(call.span().clone())
            .await
        {
            Ok(Ok(output)) if !output.matches(operation) => Err(ProviderError::Uncertain(
                format!("provider returned a non-{} result", operation),
            )),
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        match result {
            Ok(output) => {
                let latency = call.finish("succeeded");
                self.metrics
                    .record_provider_end(ProviderCallOutcome::Succeeded, latency);

                let output_ref = output.output_ref(reservation.usage_id);
                self.commit(&reservation, Some(output_ref.clone())).await?;
                let voice_clone = match (&request, &output) {
                    (OperationRequest::VoiceClone(params), OperationOutput::VoiceCloned { voice_id }) => {
                        let sample = SampleMetadata {
                            filename: params.filename.clone(),
                            size_bytes: params.sample.len() as u64,
                        };
                        Some(
                            self.voices
                                .register(tenant, &params.name, params.description.clone(), voice_id, sample)
                                .await?,
                        )
                    }
                    _ => None,
                };
                debug!(tenant_id = %tenant, operation = %operation, output_ref, "Operation succeeded");
                Ok(Metered {
                    output,
                    output_ref,
                    reservation,
                    voice_clone,
                })
            }
            Err(e) if e.is_ambiguous() => {
                let latency = call.finish("ambiguous");
                self.metrics
                    .record_provider_end(ProviderCallOutcome::Ambiguous, latency);
                warn!(
                    tenant_id = %tenant,
                    operation = %operation,
                    error = %e,
                    "Provider outcome ambiguous; charge kept"
                );
                self.keep_charge(&reservation).await?;
                Err(AdmissionError::ProviderFailure {
                    message: e.to_string(),
                    refunded: false,
                })
            }
            Err(e) => {
                let latency = call.finish("failed");
                self.metrics
                    .record_provider_end(ProviderCallOutcome::Failed, latency);
                warn!(
                    tenant_id = %tenant,
                    operation = %operation,
                    error = %e,
                    "Provider call failed; refunding"
                );
                self.refund(&reservation).await?;
                Err(AdmissionError::ProviderFailure {
                    message: e.to_string(),
                    refunded: true,
                })
            }
        }
    }

    /// Server-side entitlement enforcement for one request.
    pub async fn check_entitlements(
        &self,
        tenant: &TenantId,
        plan: &Plan,
        request: &OperationRequest,
    ) -> AdmissionResult<()> {
        let mut required = Vec::with_capacity(3);
        match request {
            OperationRequest::TextToSpeech(params) => {
                required.push(Capability::Quality(params.quality));
                required.push(Capability::language(&params.language));
                // A tenant's own trained clone is always usable.
                if !self.voices.owns_ready_voice(tenant, &params.voice_id).await? {
                    required.push(Capability::voice(params.voice_id.clone()));
                }
            }
            OperationRequest::SpeechToText(params) => {
                required.push(Capability::language(&params.language));
            }
            OperationRequest::VoiceClone(_) => required.push(Capability::VoiceCloning),
        }

        for capability in &required {
            if let Err(denied) = self.entitlements.check(&plan.id, capability) {
                self.metrics.record_entitlement_denied();
                info!(
                    tenant_id = %tenant,
                    plan_id = %plan.id,
                    capability = %capability,
                    "Entitlement denied"
                );
                return Err(denied.into());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("ledger", &self.ledger)
            .field("cost_policy", &self.cost_policy.name())
            .field("provider_timeout", &self.provider_timeout)
            .field("audit_rejections", &self.audit_rejections)
            .finish()
    }
}

/// Reject malformed requests before any token is touched.
fn validate(request: &OperationRequest) -> AdmissionResult<()> {
    match request {
        OperationRequest::TextToSpeech(p) => {
            if p.text.trim().is_empty() {
                return Err(AdmissionError::invalid("text is required"));
            }
            let chars = p.text.chars().count();
            if chars > MAX_TEXT_CHARS {
                return Err(AdmissionError::invalid(format!(
                    "text is {} characters; the limit is {}",
                    chars, MAX_TEXT_CHARS
                )));
            }
            if p.voice_id.trim().is_empty() {
                return Err(AdmissionError::invalid("voice is required"));
            }
            if p.language.trim().is_empty() {
                return Err(AdmissionError::invalid("language must not be empty"));
            }
        }
        OperationRequest::SpeechToText(p) => {
            if p.audio.is_empty() {
                return Err(AdmissionError::invalid("audio file is empty"));
            }
            if p.filename.trim().is_empty() {
                return Err(AdmissionError::invalid("filename is required"));
            }
            if p.language.trim().is_empty() {
                return Err(AdmissionError::invalid("language must not be empty"));
            }
        }
        OperationRequest::VoiceClone(p) => {
            if p.name.trim().is_empty() {
                return Err(AdmissionError::invalid("voice name is required"));
            }
            if p.sample.is_empty() {
                return Err(AdmissionError::invalid("voice sample is empty"));
            }
            if p.filename.trim().is_empty() {
                return Err(AdmissionError::invalid("filename is required"));
            }
        }
    }
    Ok(())
}
