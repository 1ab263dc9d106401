//! Billing event reconciliation.
//!
//! Every transition is decided by diffing the incoming plan, status and
//! period against the stored subscription row, so a redelivered or
//! reordered event can never reset a ledger twice.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::event::{
    BillingEvent, BillingEventKind, CheckoutSession, InvoiceObject, SubscriptionObject,
};
use super::gateway::BillingGateway;
use super::signature::SignatureVerifier;
use super::subscription::{Subscription, SubscriptionStatus};
use super::{ReconcileError, ReconcileResult};
use crate::ledger::QuotaLedger;
use crate::observability::{BillingDisposition, MetricsRegistry, billing_event_span};
use crate::plans::{BillingCycle, Plan, PlanCatalog};
use crate::store::{
    CommitOutcome, EventRepository, LedgerReset, ProcessedEvent, Store, StoreError,
    SubscriptionChange, SubscriptionRepository,
};
use crate::types::{PlanId, SharedClock, TenantId, Tokens};

/// An invoice arriving this close to the stored period end counts as the
/// renewal invoice when the processor gives no period.
const RENEWAL_WINDOW_HOURS: i64 = 24;

/// Decisions made against a row another writer moved first are retried
/// this many times in total.
const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created { plan: PlanId },
    PlanChanged { from: PlanId, to: PlanId },
    Renewed,
    StatusChanged {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
    Canceled,
    NoChange,
    Duplicate,
    Ignored(String),
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::PlanChanged { .. } => "plan_changed",
            Self::Renewed => "renewed",
            Self::StatusChanged { .. } => "status_changed",
            Self::Canceled => "canceled",
            Self::NoChange => "no_change",
            Self::Duplicate => "duplicate",
            Self::Ignored(_) => "ignored",
        }
    }

    fn disposition(&self) -> BillingDisposition {
        match self {
            Self::Duplicate => BillingDisposition::Duplicate,
            Self::Ignored(_) => BillingDisposition::Ignored,
            _ => BillingDisposition::Applied,
        }
    }
}

/// Desired subscription state derived from one event.
struct Incoming {
    tenant_id: TenantId,
    plan: Plan,
    cycle: BillingCycle,
    status: SubscriptionStatus,
    period: (DateTime<Utc>, DateTime<Utc>),
    /// The period came from the processor rather than being assumed.
    period_reported: bool,
    external_id: String,
    customer: Option<String>,
    cancel_at_period_end: Option<bool>,
}

/// What one event does, decided from a read of the stored row and written
/// by a single commit.
struct Decision {
    outcome: ReconcileOutcome,
    change: Option<SubscriptionChange>,
}

impl Decision {
    fn unchanged(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome,
            change: None,
        }
    }
}

#[derive(Clone)]
pub struct BillingReconciler {
    store: Arc<dyn Store>,
    ledger: QuotaLedger,
    catalog: Arc<PlanCatalog>,
    verifier: SignatureVerifier,
    gateway: Option<Arc<dyn BillingGateway>>,
    clock: SharedClock,
    metrics: Arc<MetricsRegistry>,
    // Serializes read-diff-write within this process. Across processes the
    // store's commit_event rejects stale decisions.
    apply_lock: Arc<Mutex<()>>,
}

impl BillingReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: QuotaLedger,
        catalog: Arc<PlanCatalog>,
        verifier: SignatureVerifier,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            ledger,
            catalog,
            verifier,
            gateway: None,
            clock,
            metrics: Arc::new(MetricsRegistry::default()),
            apply_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn BillingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Verify, parse and process one raw webhook delivery. Nothing is
    /// mutated unless the signature checks out.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ReconcileResult<ReconcileOutcome> {
        let checked = match signature {
            Some(header) => self.verifier.verify(payload, header),
            None => {
                warn!("Billing webhook without signature header");
                Err(ReconcileError::invalid("missing signature header"))
            }
        };
        let event = checked.and_then(|()| BillingEvent::parse(payload));
        match event {
            Ok(event) => self.process(event).await,
            Err(e) => {
                self.metrics.record_billing_event(BillingDisposition::Rejected);
                Err(e)
            }
        }
    }

    /// Process events independently; a failing event never stops the rest.
    pub async fn handle_batch(
        &self,
        events: Vec<BillingEvent>,
    ) -> Vec<(String, ReconcileResult<ReconcileOutcome>)> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            let id = event.id.clone();
            results.push((id, self.process(event).await));
        }
        results
    }

    /// Apply one verified event, at most once per event id.
    pub async fn process(&self, event: BillingEvent) -> ReconcileResult<ReconcileOutcome> {
        let span = billing_event_span(&event.id, &event.event_type);
        self.process_inner(event).instrument(span).await
    }

    async fn process_inner(&self, event: BillingEvent) -> ReconcileResult<ReconcileOutcome> {
        let _guard = self.apply_lock.lock().await;

        if self.store.is_event_processed(&event.id).await? {
            info!("Billing event already processed");
            self.metrics.record_billing_event(BillingDisposition::Duplicate);
            return Ok(ReconcileOutcome::Duplicate);
        }

        match self.decide_and_commit(&event).await {
            Ok(outcome) => {
                Span::current().record("outcome", outcome.as_str());
                self.metrics.record_billing_event(outcome.disposition());
                info!(outcome = outcome.as_str(), "Billing event processed");
                Ok(outcome)
            }
            Err(e @ ReconcileError::Unreconcilable { .. }) => {
                warn!(error = %e, "Billing event needs manual review");
                self.metrics
                    .record_billing_event(BillingDisposition::Unreconcilable);
                Err(e)
            }
            Err(e @ ReconcileError::InvalidEvent(_)) => {
                warn!(error = %e, "Billing event rejected");
                self.metrics.record_billing_event(BillingDisposition::Rejected);
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Billing event processing failed");
                Err(e)
            }
        }
    }

    /// Decide from the stored row, then record the event id together with
    /// the decided write. A row moved by another writer in between forces a
    /// fresh decision; an event id recorded in between makes this delivery
    /// a duplicate.
    async fn decide_and_commit(&self, event: &BillingEvent) -> ReconcileResult<ReconcileOutcome> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let Decision { outcome, change } = self.dispatch(event).await?;
            let record = ProcessedEvent {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                processed_at: self.clock.now(),
            };
            match self.store.commit_event(record, change.as_ref()).await? {
                CommitOutcome::Committed => {
                    if let Some(change) = &change {
                        log_committed(&outcome, change);
                    }
                    return Ok(outcome);
                }
                CommitOutcome::Duplicate => return Ok(ReconcileOutcome::Duplicate),
                CommitOutcome::Conflict => {
                    debug!(attempt, "Subscription changed concurrently; deciding again");
                }
            }
        }
        Err(StoreError::Conflict {
            message: format!("subscription kept changing while applying event {}", event.id),
        }
        .into())
    }

    async fn dispatch(&self, event: &BillingEvent) -> ReconcileResult<Decision> {
        match &event.kind {
            BillingEventKind::CheckoutCompleted(session) => self.on_checkout(event, session).await,
            BillingEventKind::SubscriptionCreated(sub)
            | BillingEventKind::SubscriptionUpdated(sub) => {
                self.on_subscription_changed(event, sub).await
            }
            BillingEventKind::SubscriptionDeleted(sub) => {
                let current = self.require_subscription(event, &sub.id).await?;
                self.cancel(current).await
            }
            BillingEventKind::InvoicePaid(invoice) => self.on_invoice_paid(event, invoice).await,
            BillingEventKind::InvoicePaymentFailed(invoice) => {
                self.on_invoice_failed(event, invoice).await
            }
            BillingEventKind::Unhandled(raw) => {
                debug!(event_type = %raw, "Unhandled billing event type");
                Ok(Decision::unchanged(ReconcileOutcome::Ignored(raw.clone())))
            }
        }
    }

    async fn on_checkout(
        &self,
        event: &BillingEvent,
        session: &CheckoutSession,
    ) -> ReconcileResult<Decision> {
        let Some(external_id) = session.subscription.as_deref().filter(|_| session.is_subscription()) else {
            return Ok(Decision::unchanged(ReconcileOutcome::Ignored(format!(
                "{} (not a subscription checkout)",
                event.event_type
            ))));
        };
        let tenant = session.tenant_id().ok_or_else(|| {
            ReconcileError::unreconcilable(&event.id, "checkout session carries no tenant id")
        })?;

        let remote = self.fetch(external_id).await?;
        let (plan, cycle) = self.resolve_plan(
            &event.id,
            &[
                remote.as_ref().and_then(|s| s.price_ref()),
                session.price_ref(),
            ],
            session.plan_id(),
            session.billing_cycle(),
        )?;
        let reported = remote.as_ref().and_then(|s| s.period());
        let period_reported = reported.is_some();
        let period =
            reported.unwrap_or((event.created, event.created + cycle.nominal_period()));
        let status = remote
            .as_ref()
            .map(|s| SubscriptionStatus::from_external(&s.status))
            .unwrap_or(SubscriptionStatus::Active);

        let current = self.store.subscription_by_external_id(external_id).await?;
        if let Some(existing) = &current {
            if existing.tenant_id != tenant {
                return Err(ReconcileError::unreconcilable(
                    &event.id,
                    format!("subscription {} belongs to another tenant", external_id),
                ));
            }
        }

        self.apply(
            current,
            Incoming {
                tenant_id: tenant,
                plan,
                cycle,
                status,
                period,
                period_reported,
                external_id: external_id.to_string(),
                customer: session.customer.clone(),
                cancel_at_period_end: remote.as_ref().map(|s| s.cancel_at_period_end),
            },
        )
        .await
    }

    async fn on_subscription_changed(
        &self,
        event: &BillingEvent,
        sub: &SubscriptionObject,
    ) -> ReconcileResult<Decision> {
        let current = self.store.subscription_by_external_id(&sub.id).await?;
        let tenant = match (&current, sub.tenant_id()) {
            (Some(existing), _) => existing.tenant_id.clone(),
            (None, Some(tenant)) => tenant,
            (None, None) => {
                return Err(ReconcileError::unreconcilable(
                    &event.id,
                    format!("unknown subscription {} with no tenant metadata", sub.id),
                ));
            }
        };

        let (plan, cycle) = match (sub.price_ref(), &current) {
            (Some(price), _) => self.resolve_plan(&event.id, &[Some(price)], None, None)?,
            (None, Some(existing)) => (self.stored_plan(&event.id, existing)?, existing.cycle),
            (None, None) => {
                return Err(ReconcileError::unreconcilable(
                    &event.id,
                    format!("subscription {} carries no price", sub.id),
                ));
            }
        };
        let period_reported = sub.period().is_some();
        let period = sub
            .period()
            .or_else(|| {
                current
                    .as_ref()
                    .map(|c| (c.current_period_start, c.current_period_end))
            })
            .unwrap_or((event.created, event.created + cycle.nominal_period()));
        let status = if sub.status.is_empty() {
            current
                .as_ref()
                .map(|c| c.status)
                .unwrap_or(SubscriptionStatus::Active)
        } else {
            SubscriptionStatus::from_external(&sub.status)
        };

        self.apply(
            current,
            Incoming {
                tenant_id: tenant,
                plan,
                cycle,
                status,
                period,
                period_reported,
                external_id: sub.id.clone(),
                customer: sub.customer.clone(),
                cancel_at_period_end: Some(sub.cancel_at_period_end),
            },
        )
        .await
    }

    async fn on_invoice_paid(
        &self,
        event: &BillingEvent,
        invoice: &InvoiceObject,
    ) -> ReconcileResult<Decision> {
        let Some(external_id) = invoice.subscription.as_deref() else {
            return Ok(Decision::unchanged(ReconcileOutcome::Ignored(format!(
                "{} (no subscription)",
                event.event_type
            ))));
        };
        let current = self.require_subscription(event, external_id).await?;
        let remote = self.fetch(external_id).await?;
        if remote.is_none() && current.status == SubscriptionStatus::Canceled {
            debug!(subscription = external_id, "Invoice paid for a canceled subscription");
            return Ok(Decision::unchanged(ReconcileOutcome::NoChange));
        }

        let known_price = remote
            .as_ref()
            .and_then(|s| s.price_ref())
            .and_then(|price| self.catalog.by_price_ref(price));
        let (plan, cycle) = match known_price {
            Some((plan, cycle)) => (plan.clone(), cycle),
            None => (self.stored_plan(&event.id, &current)?, current.cycle),
        };
        let reported = remote
            .as_ref()
            .and_then(|s| s.period())
            .or_else(|| invoice.line_period());
        let period_reported = reported.is_some();
        let period = reported.unwrap_or_else(|| fallback_period(&current, event.created));
        let status = remote
            .as_ref()
            .map(|s| SubscriptionStatus::from_external(&s.status))
            .unwrap_or(SubscriptionStatus::Active);

        self.apply(
            Some(current.clone()),
            Incoming {
                tenant_id: current.tenant_id.clone(),
                plan,
                cycle,
                status,
                period,
                period_reported,
                external_id: external_id.to_string(),
                customer: invoice.customer.clone(),
                cancel_at_period_end: remote.as_ref().map(|s| s.cancel_at_period_end),
            },
        )
        .await
    }

    async fn on_invoice_failed(
        &self,
        event: &BillingEvent,
        invoice: &InvoiceObject,
    ) -> ReconcileResult<Decision> {
        let Some(external_id) = invoice.subscription.as_deref() else {
            return Ok(Decision::unchanged(ReconcileOutcome::Ignored(format!(
                "{} (no subscription)",
                event.event_type
            ))));
        };
        let current = self.require_subscription(event, external_id).await?;
        if current.status == SubscriptionStatus::Canceled {
            return Ok(Decision::unchanged(ReconcileOutcome::NoChange));
        }

        let plan = self.stored_plan(&event.id, &current)?;
        self.apply(
            Some(current.clone()),
            Incoming {
                tenant_id: current.tenant_id.clone(),
                plan,
                cycle: current.cycle,
                status: SubscriptionStatus::PastDue,
                period: (current.current_period_start, current.current_period_end),
                period_reported: false,
                external_id: external_id.to_string(),
                customer: None,
                cancel_at_period_end: None,
            },
        )
        .await
    }

    /// Diff `incoming` against the stored row and decide what to write.
    /// The ledger is reset only for a new subscription, a plan change, a
    /// period renewal or a revival from canceled. A reported period that
    /// replaces an assumed one is not a renewal.
    async fn apply(
        &self,
        current: Option<Subscription>,
        incoming: Incoming,
    ) -> ReconcileResult<Decision> {
        let now = self.clock.now();
        let (start, end) = incoming.period;

        let Some(current) = current else {
            if incoming.status == SubscriptionStatus::Canceled {
                return Ok(Decision::unchanged(ReconcileOutcome::NoChange));
            }
            let mut created = Subscription::new(
                incoming.tenant_id.clone(),
                incoming.plan.id.clone(),
                incoming.external_id,
                incoming.cycle,
                start,
                end,
                now,
            )
            .with_status(incoming.status)
            .with_customer(incoming.customer);
            created.cancel_at_period_end = incoming.cancel_at_period_end.unwrap_or(false);
            created.period_synthesized = !incoming.period_reported;
            return Ok(Decision {
                outcome: ReconcileOutcome::Created {
                    plan: created.plan_id.clone(),
                },
                change: Some(SubscriptionChange {
                    expected: None,
                    reset: Some(self.reset_to(incoming.plan.tokens_per_month)),
                    subscription: created,
                }),
            });
        };

        if incoming.status == SubscriptionStatus::Canceled {
            return self.cancel(current).await;
        }

        // The processor's view of the cycle an assumed period stood in for.
        let adopted = current.period_synthesized
            && incoming.period_reported
            && start < current.current_period_end
            && end > current.current_period_start;
        if !adopted && end < current.current_period_end {
            debug!(
                stored_end = %current.current_period_end,
                incoming_end = %end,
                "Stale billing event; period not moved back"
            );
            return Ok(Decision::unchanged(ReconcileOutcome::NoChange));
        }

        let plan_changed = incoming.plan.id != current.plan_id;
        let renewed = !adopted && end > current.current_period_end;
        let revived = !current.grants_plan() && incoming.status.grants_plan();

        let mut row = current.clone();
        row.plan_id = incoming.plan.id.clone();
        row.cycle = incoming.cycle;
        row.status = incoming.status;
        if adopted || renewed {
            row.current_period_start = start;
            row.current_period_end = end;
            row.period_synthesized = !incoming.period_reported;
        }
        if let Some(flag) = incoming.cancel_at_period_end {
            row.cancel_at_period_end = flag;
        }
        if incoming.customer.is_some() {
            row.external_customer_id = incoming.customer;
        }
        if row == current {
            return Ok(Decision::unchanged(ReconcileOutcome::NoChange));
        }
        if adopted {
            debug!(
                assumed_end = %current.current_period_end,
                reported_end = %end,
                "Processor period replaces the assumed one"
            );
        }
        row.updated_at = now;

        let reset = (plan_changed || renewed || revived)
            .then(|| self.reset_to(incoming.plan.tokens_per_month));
        let outcome = if plan_changed {
            ReconcileOutcome::PlanChanged {
                from: current.plan_id.clone(),
                to: row.plan_id.clone(),
            }
        } else if renewed {
            ReconcileOutcome::Renewed
        } else if row.status != current.status {
            ReconcileOutcome::StatusChanged {
                from: current.status,
                to: row.status,
            }
        } else {
            ReconcileOutcome::NoChange
        };
        Ok(Decision {
            outcome,
            change: Some(SubscriptionChange {
                expected: Some(current),
                subscription: row,
                reset,
            }),
        })
    }

    /// Cancel and, unless another subscription still grants a plan, move
    /// the tenant to the free allotment.
    async fn cancel(&self, current: Subscription) -> ReconcileResult<Decision> {
        if current.status == SubscriptionStatus::Canceled {
            return Ok(Decision::unchanged(ReconcileOutcome::NoChange));
        }
        let mut row = current.clone();
        row.status = SubscriptionStatus::Canceled;
        row.updated_at = self.clock.now();

        let others_live = self
            .store
            .list_subscriptions(&row.tenant_id)
            .await?
            .iter()
            .any(|s| s.external_subscription_id != row.external_subscription_id && s.grants_plan());
        let reset = (!others_live).then(|| self.reset_to(self.catalog.free().tokens_per_month));
        Ok(Decision {
            outcome: ReconcileOutcome::Canceled,
            change: Some(SubscriptionChange {
                expected: Some(current),
                subscription: row,
                reset,
            }),
        })
    }

    fn reset_to(&self, allotment: Tokens) -> LedgerReset {
        LedgerReset {
            allotment,
            reset_date: self.ledger.next_reset_date(),
        }
    }

    async fn fetch(&self, external_id: &str) -> ReconcileResult<Option<SubscriptionObject>> {
        match &self.gateway {
            Some(gateway) => gateway.retrieve_subscription(external_id).await,
            None => Ok(None),
        }
    }

    async fn require_subscription(
        &self,
        event: &BillingEvent,
        external_id: &str,
    ) -> ReconcileResult<Subscription> {
        self.store
            .subscription_by_external_id(external_id)
            .await?
            .ok_or_else(|| {
                ReconcileError::unreconcilable(
                    &event.id,
                    format!("unknown subscription {}", external_id),
                )
            })
    }

    fn stored_plan(&self, event_id: &str, subscription: &Subscription) -> ReconcileResult<Plan> {
        self.catalog.get(&subscription.plan_id).cloned().ok_or_else(|| {
            ReconcileError::unreconcilable(
                event_id,
                format!("stored plan {} is not in the catalog", subscription.plan_id),
            )
        })
    }

    /// Price references win over a plan id; the first known one is used.
    fn resolve_plan(
        &self,
        event_id: &str,
        price_refs: &[Option<&str>],
        plan_id: Option<PlanId>,
        cycle: Option<BillingCycle>,
    ) -> ReconcileResult<(Plan, BillingCycle)> {
        for price in price_refs.iter().flatten() {
            if let Some((plan, cycle)) = self.catalog.by_price_ref(price) {
                return Ok((plan.clone(), cycle));
            }
        }
        if let Some(plan) = plan_id.as_ref().and_then(|id| self.catalog.get(id)) {
            return Ok((plan.clone(), cycle.unwrap_or_default()));
        }
        let prices: Vec<&str> = price_refs.iter().flatten().copied().collect();
        Err(ReconcileError::unreconcilable(
            event_id,
            format!(
                "no catalog plan for prices {:?} or plan id {:?}",
                prices,
                plan_id.map(|p| p.to_string())
            ),
        ))
    }
}

fn log_committed(outcome: &ReconcileOutcome, change: &SubscriptionChange) {
    let row = &change.subscription;
    match outcome {
        ReconcileOutcome::Created { .. } => info!(
            tenant_id = %row.tenant_id,
            plan_id = %row.plan_id,
            status = %row.status,
            "Subscription created"
        ),
        ReconcileOutcome::PlanChanged { from, to } => info!(
            tenant_id = %row.tenant_id,
            from = %from,
            to = %to,
            "Subscription plan changed"
        ),
        ReconcileOutcome::Renewed => info!(
            tenant_id = %row.tenant_id,
            period_end = %row.current_period_end,
            "Subscription renewed"
        ),
        ReconcileOutcome::StatusChanged { from, to } => info!(
            tenant_id = %row.tenant_id,
            from = %from,
            to = %to,
            "Subscription status changed"
        ),
        ReconcileOutcome::Canceled => info!(
            tenant_id = %row.tenant_id,
            plan_id = %row.plan_id,
            "Subscription canceled"
        ),
        _ => debug!(
            tenant_id = %row.tenant_id,
            period_end = %row.current_period_end,
            "Subscription details updated"
        ),
    }
    if let Some(reset) = &change.reset {
        info!(
            tenant_id = %row.tenant_id,
            allotment = reset.allotment,
            reset_date = %reset.reset_date,
            "Quota reset"
        );
    }
}

/// Period to assume for a paid invoice when neither the processor nor the
/// invoice lines say: a renewal if the invoice lands near or after the
/// stored period end, the stored period otherwise.
fn fallback_period(current: &Subscription, created: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    if created >= current.current_period_end - Duration::hours(RENEWAL_WINDOW_HOURS) {
        let start = current.current_period_end;
        (start, start + current.cycle.nominal_period())
    } else {
        (current.current_period_start, current.current_period_end)
    }
}

impl std::fmt::Debug for BillingReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingReconciler")
            .field("store", &self.store.name())
            .field("gateway", &self.gateway.as_ref().map(|g| g.name().to_string()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerEntry;
    use crate::store::{ConsumeOutcome, MemoryStore};
    use crate::types::{Clock, ManualClock, OperationClass};
    use crate::usage::UsageRecord;
    use secrecy::SecretString;
    use serde_json::{Value, json};

    struct Harness {
        reconciler: BillingReconciler,
        store: Arc<MemoryStore>,
        ledger: QuotaLedger,
        clock: ManualClock,
        verifier: SignatureVerifier,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let shared: SharedClock = Arc::new(clock.clone());
        let catalog = Arc::new(PlanCatalog::default());
        let ledger = QuotaLedger::new(store.clone(), catalog.clone(), shared.clone());
        let verifier = SignatureVerifier::new(SecretString::from("whsec_test"), shared.clone());
        let reconciler = BillingReconciler::new(
            store.clone(),
            ledger.clone(),
            catalog,
            verifier.clone(),
            shared,
        );
        Harness {
            reconciler,
            store,
            ledger,
            clock,
            verifier,
        }
    }

    fn event(id: &str, event_type: &str, created: DateTime<Utc>, object: Value) -> BillingEvent {
        let raw = json!({
            "id": id,
            "type": event_type,
            "created": created.timestamp(),
            "data": {"object": object},
        });
        BillingEvent::parse(raw.to_string().as_bytes()).unwrap()
    }

    fn checkout(id: &str, tenant: &str, plan: &str, at: DateTime<Utc>) -> BillingEvent {
        event(
            id,
            "checkout.session.completed",
            at,
            json!({
                "id": "cs_1",
                "mode": "subscription",
                "subscription": "sub_1",
                "customer": "cus_1",
                "metadata": {"userId": tenant, "planId": plan, "billingCycle": "monthly"},
            }),
        )
    }

    fn updated(id: &str, price: &str, status: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> BillingEvent {
        event(
            id,
            "customer.subscription.updated",
            end,
            json!({
                "id": "sub_1",
                "status": status,
                "current_period_start": start.timestamp(),
                "current_period_end": end.timestamp(),
                "items": {"data": [{"price": {"id": price}}]},
            }),
        )
    }

    async fn consume(h: &Harness, tenant: &TenantId) {
        let outcome = h
            .ledger
            .decrement(
                tenant,
                OperationClass::Tts,
                1,
                250,
                UsageRecord::new(tenant.clone(), OperationClass::Tts, 1, "x", h.clock.now()),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ConsumeOutcome::Granted { .. }));
    }

    async fn amounts(h: &Harness, tenant: &TenantId) -> Vec<(u32, u32)> {
        h.ledger
            .snapshot(tenant)
            .await
            .unwrap()
            .iter()
            .map(|e: &LedgerEntry| (e.tokens_used, e.tokens_remaining))
            .collect()
    }

    /// Checkout at `now`, stored period [now, now + 30d) to the second.
    async fn subscribed(h: &Harness) -> (TenantId, DateTime<Utc>, DateTime<Utc>) {
        let now = h.clock.now();
        let outcome = h.reconciler.process(checkout("evt_checkout", "t1", "pro", now)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created { plan: PlanId::from("pro") });
        let sub = h.store.subscription_by_external_id("sub_1").await.unwrap().unwrap();
        (TenantId::from("t1"), sub.current_period_start, sub.current_period_end)
    }

    #[tokio::test]
    async fn test_checkout_resets_ledger_to_plan_allotment() {
        let h = harness();
        let tenant = TenantId::from("t1");
        assert_eq!(amounts(&h, &tenant).await, vec![(0, 25); 3]);

        subscribed(&h).await;

        assert_eq!(amounts(&h, &tenant).await, vec![(0, 250); 3]);
        let sub = h.store.current_subscription(&tenant).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.external_customer_id.as_deref(), Some("cus_1"));
    }

    #[tokio::test]
    async fn test_replayed_event_is_duplicate() {
        let h = harness();
        let (tenant, _, _) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let replay = h
            .reconciler
            .process(checkout("evt_checkout", "t1", "pro", h.clock.now()))
            .await
            .unwrap();
        assert_eq!(replay, ReconcileOutcome::Duplicate);
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
        assert_eq!(h.store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_under_new_id_does_not_reset() {
        let h = harness();
        let (tenant, start, _) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let again = h
            .reconciler
            .process(checkout("evt_other", "t1", "pro", start))
            .await
            .unwrap();
        assert_eq!(again, ReconcileOutcome::NoChange);
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
    }

    #[tokio::test]
    async fn test_update_without_changes_leaves_ledger() {
        let h = harness();
        let (tenant, start, end) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let outcome = h
            .reconciler
            .process(updated("evt_u1", "price_pro_monthly", "active", start, end))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoChange);
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
    }

    #[tokio::test]
    async fn test_plan_change_resets_to_new_allotment() {
        let h = harness();
        let (tenant, start, end) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let outcome = h
            .reconciler
            .process(updated("evt_u1", "price_premium_monthly", "active", start, end))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::PlanChanged {
                from: PlanId::from("pro"),
                to: PlanId::from("premium"),
            }
        );
        assert_eq!(amounts(&h, &tenant).await, vec![(0, 500); 3]);
    }

    #[tokio::test]
    async fn test_renewal_resets_and_keeps_plan() {
        let h = harness();
        let (tenant, _, end) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let next_end = end + Duration::days(30);
        let outcome = h
            .reconciler
            .process(updated("evt_u1", "price_pro_monthly", "active", end, next_end))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Renewed);
        assert_eq!(amounts(&h, &tenant).await, vec![(0, 250); 3]);
        let sub = h.store.current_subscription(&tenant).await.unwrap().unwrap();
        assert_eq!(sub.current_period_end.timestamp(), next_end.timestamp());
    }

    #[tokio::test]
    async fn test_stale_period_is_ignored() {
        let h = harness();
        let (tenant, start, end) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let outcome = h
            .reconciler
            .process(updated(
                "evt_old",
                "price_premium_monthly",
                "active",
                start - Duration::days(30),
                end - Duration::days(30),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoChange);
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
    }

    #[tokio::test]
    async fn test_payment_failure_marks_past_due_without_reset() {
        let h = harness();
        let (tenant, _, _) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let outcome = h
            .reconciler
            .process(event(
                "evt_f1",
                "invoice.payment_failed",
                h.clock.now(),
                json!({"id": "in_1", "subscription": "sub_1"}),
            ))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::StatusChanged {
                from: SubscriptionStatus::Active,
                to: SubscriptionStatus::PastDue,
            }
        );
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
        // past_due still grants the plan
        assert_eq!(h.ledger.current_plan(&tenant).await.unwrap().id.as_str(), "pro");
    }

    #[tokio::test]
    async fn test_payment_recovery_keeps_consumed_tokens() {
        let h = harness();
        let (tenant, start, end) = subscribed(&h).await;
        consume(&h, &tenant).await;
        h.reconciler
            .process(event(
                "evt_f1",
                "invoice.payment_failed",
                h.clock.now(),
                json!({"id": "in_1", "subscription": "sub_1"}),
            ))
            .await
            .unwrap();

        let outcome = h
            .reconciler
            .process(updated("evt_u1", "price_pro_monthly", "active", start, end))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::StatusChanged {
                from: SubscriptionStatus::PastDue,
                to: SubscriptionStatus::Active,
            }
        );
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
    }

    #[tokio::test]
    async fn test_reported_period_replaces_assumed_checkout_period() {
        let h = harness();
        let (tenant, start, _) = subscribed(&h).await;
        let sub = h.store.subscription_by_external_id("sub_1").await.unwrap().unwrap();
        assert!(sub.period_synthesized);
        consume(&h, &tenant).await;
        consume(&h, &tenant).await;

        // The processor's cycle began a second before the checkout event
        // and runs 31 days, past the assumed 30-day end.
        let reported_start = start - Duration::seconds(1);
        let reported_end = reported_start + Duration::days(31);
        let created = event(
            "evt_sub_created",
            "customer.subscription.created",
            h.clock.now(),
            json!({
                "id": "sub_1",
                "status": "active",
                "current_period_start": reported_start.timestamp(),
                "current_period_end": reported_end.timestamp(),
                "items": {"data": [{"price": {"id": "price_pro_monthly"}}]},
                "metadata": {"userId": "t1"},
            }),
        );
        let outcome = h.reconciler.process(created).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoChange);
        assert_eq!(amounts(&h, &tenant).await[0], (2, 248));

        let sub = h.store.subscription_by_external_id("sub_1").await.unwrap().unwrap();
        assert!(!sub.period_synthesized);
        assert_eq!(sub.current_period_end.timestamp(), reported_end.timestamp());

        // The first paid invoice for that same cycle is not a renewal either.
        let paid = h
            .reconciler
            .process(event(
                "evt_i1",
                "invoice.paid",
                h.clock.now(),
                json!({
                    "id": "in_1",
                    "subscription": "sub_1",
                    "lines": {"data": [{"period": {
                        "start": reported_start.timestamp(),
                        "end": reported_end.timestamp(),
                    }}]},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(paid, ReconcileOutcome::NoChange);
        assert_eq!(amounts(&h, &tenant).await[0], (2, 248));

        let next = h
            .reconciler
            .process(updated(
                "evt_u2",
                "price_pro_monthly",
                "active",
                reported_end,
                reported_end + Duration::days(30),
            ))
            .await
            .unwrap();
        assert_eq!(next, ReconcileOutcome::Renewed);
        assert_eq!(amounts(&h, &tenant).await[0], (0, 250));
    }

    fn second_instance(h: &Harness) -> BillingReconciler {
        let shared: SharedClock = Arc::new(h.clock.clone());
        BillingReconciler::new(
            h.store.clone(),
            h.ledger.clone(),
            Arc::new(PlanCatalog::default()),
            h.verifier.clone(),
            shared,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_racing_on_one_delivery_reset_once() {
        let h = harness();
        let (tenant, _, end) = subscribed(&h).await;
        consume(&h, &tenant).await;
        let other = second_instance(&h);

        let renewal = updated("evt_r1", "price_pro_monthly", "active", end, end + Duration::days(30));
        let (a, b) = tokio::join!(
            h.reconciler.process(renewal.clone()),
            other.process(renewal.clone())
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o.as_str());
        assert_eq!(outcomes, vec![ReconcileOutcome::Duplicate, ReconcileOutcome::Renewed]);

        consume(&h, &tenant).await;
        let late = other.process(renewal).await.unwrap();
        assert_eq!(late, ReconcileOutcome::Duplicate);
        assert_eq!(amounts(&h, &tenant).await[0], (1, 249));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_racing_on_one_renewal_reset_once() {
        let h = harness();
        let (tenant, _, end) = subscribed(&h).await;
        consume(&h, &tenant).await;
        let other = second_instance(&h);

        // Same renewal delivered under two event ids.
        let next_end = end + Duration::days(30);
        let (a, b) = tokio::join!(
            h.reconciler
                .process(updated("evt_r1", "price_pro_monthly", "active", end, next_end)),
            other.process(updated("evt_r2", "price_pro_monthly", "active", end, next_end))
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o.as_str());
        assert_eq!(outcomes, vec![ReconcileOutcome::NoChange, ReconcileOutcome::Renewed]);
        assert!(h.store.is_event_processed("evt_r1").await.unwrap());
        assert!(h.store.is_event_processed("evt_r2").await.unwrap());
        assert_eq!(amounts(&h, &tenant).await[0], (0, 250));
    }

    #[tokio::test]
    async fn test_invoice_near_period_end_renews() {
        let h = harness();
        let (tenant, _, end) = subscribed(&h).await;
        consume(&h, &tenant).await;

        let early = h
            .reconciler
            .process(event(
                "evt_i0",
                "invoice.paid",
                h.clock.now(),
                json!({"id": "in_0", "subscription": "sub_1"}),
            ))
            .await
            .unwrap();
        assert_eq!(early, ReconcileOutcome::NoChange);

        let outcome = h
            .reconciler
            .process(event(
                "evt_i1",
                "invoice.paid",
                end,
                json!({"id": "in_1", "subscription": "sub_1"}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Renewed);
        assert_eq!(amounts(&h, &tenant).await[0], (0, 250));
    }

    #[tokio::test]
    async fn test_cancellation_moves_tenant_to_free() {
        let h = harness();
        let (tenant, _, _) = subscribed(&h).await;

        let outcome = h
            .reconciler
            .process(event(
                "evt_d1",
                "customer.subscription.deleted",
                h.clock.now(),
                json!({"id": "sub_1", "status": "canceled"}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Canceled);
        assert_eq!(amounts(&h, &tenant).await, vec![(0, 25); 3]);
        assert!(h.ledger.current_plan(&tenant).await.unwrap().id.is_free());
    }

    #[tokio::test]
    async fn test_unknown_price_is_unreconcilable_and_batch_continues() {
        let h = harness();
        let now = h.clock.now();
        let bad = event(
            "evt_bad",
            "customer.subscription.created",
            now,
            json!({
                "id": "sub_9",
                "status": "active",
                "items": {"data": [{"price": {"id": "price_gold"}}]},
                "metadata": {"userId": "t9"},
            }),
        );
        let results = h
            .reconciler
            .handle_batch(vec![bad, checkout("evt_good", "t1", "starter", now)])
            .await;

        assert!(matches!(results[0].1, Err(ReconcileError::Unreconcilable { .. })));
        assert!(matches!(results[1].1, Ok(ReconcileOutcome::Created { .. })));
        assert!(!h.store.is_event_processed("evt_bad").await.unwrap());
    }

    #[tokio::test]
    async fn test_unhandled_event_is_ignored_and_recorded() {
        let h = harness();
        let outcome = h
            .reconciler
            .process(event("evt_c", "customer.created", h.clock.now(), json!({"id": "cus_1"})))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored("customer.created".into()));
        assert!(h.store.is_event_processed("evt_c").await.unwrap());
    }

    #[tokio::test]
    async fn test_webhook_signature_required() {
        let h = harness();
        let payload = json!({
            "id": "evt_s",
            "type": "customer.created",
            "created": h.clock.now().timestamp(),
            "data": {"object": {"id": "cus_1"}},
        })
        .to_string();

        assert!(matches!(
            h.reconciler.handle_webhook(payload.as_bytes(), None).await,
            Err(ReconcileError::InvalidEvent(_))
        ));
        assert!(matches!(
            h.reconciler
                .handle_webhook(payload.as_bytes(), Some("t=1,v1=00"))
                .await,
            Err(ReconcileError::InvalidEvent(_))
        ));
        assert!(!h.store.is_event_processed("evt_s").await.unwrap());

        let header = h
            .verifier
            .sign(payload.as_bytes(), h.clock.now().timestamp())
            .unwrap();
        assert!(h
            .reconciler
            .handle_webhook(payload.as_bytes(), Some(&header))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_gateway_supplies_period_and_price() {
        use crate::billing::{StripeGateway, StripeGatewayConfig};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let start = Utc::now().timestamp();
        Mock::given(method("GET"))
            .and(path("/v1/subscriptions/sub_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "sub_1",
                "status": "trialing",
                "current_period_start": start,
                "current_period_end": start + 365 * 86_400,
                "items": {"data": [{"price": {"id": "price_starter_yearly"}}]},
            })))
            .mount(&server)
            .await;

        let h = harness();
        let gateway = StripeGateway::new(
            StripeGatewayConfig::new(SecretString::from("sk_test")).with_base_url(server.uri()),
        )
        .unwrap();
        let reconciler = h.reconciler.clone().with_gateway(Arc::new(gateway));

        // metadata says pro; the processor's price is authoritative
        let outcome = reconciler
            .process(checkout("evt_1", "t1", "pro", h.clock.now()))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created { plan: PlanId::from("starter") });
        let sub = h.store.subscription_by_external_id("sub_1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.cycle, BillingCycle::Yearly);
        assert_eq!(sub.current_period_end.timestamp(), start + 365 * 86_400);
    }
}
