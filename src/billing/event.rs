//! Billing event envelope and the closed set of event kinds it maps to.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{ReconcileError, ReconcileResult};
use crate::plans::BillingCycle;
use crate::types::{PlanId, TenantId};

/// A verified, parsed billing event.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    pub id: String,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub kind: BillingEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    CheckoutCompleted(CheckoutSession),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaid(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    /// Any event type this service does not act on.
    Unhandled(String),
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Value,
}

impl BillingEvent {
    pub fn parse(payload: &[u8]) -> ReconcileResult<Self> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| ReconcileError::invalid(format!("malformed event envelope: {}", e)))?;
        if envelope.id.is_empty() {
            return Err(ReconcileError::invalid("event id is empty"));
        }
        let created = timestamp(envelope.created)
            .ok_or_else(|| ReconcileError::invalid("event timestamp out of range"))?;

        let object = envelope.data.object;
        let kind = match envelope.event_type.as_str() {
            "checkout.session.completed" => BillingEventKind::CheckoutCompleted(decode(object)?),
            "customer.subscription.created" => {
                BillingEventKind::SubscriptionCreated(decode(object)?)
            }
            "customer.subscription.updated" => {
                BillingEventKind::SubscriptionUpdated(decode(object)?)
            }
            "customer.subscription.deleted" => {
                BillingEventKind::SubscriptionDeleted(decode(object)?)
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                BillingEventKind::InvoicePaid(decode(object)?)
            }
            "invoice.payment_failed" => BillingEventKind::InvoicePaymentFailed(decode(object)?),
            other => BillingEventKind::Unhandled(other.to_string()),
        };

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            created,
            kind,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: Value) -> ReconcileResult<T> {
    serde_json::from_value(object)
        .map_err(|e| ReconcileError::invalid(format!("malformed event object: {}", e)))
}

pub(crate) fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Accept either a bare id or an expanded object carrying an `id`.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(String::from),
        _ => None,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    pub fn is_subscription(&self) -> bool {
        self.mode.as_deref() == Some("subscription") && self.subscription.is_some()
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        tenant_from(&self.metadata).or_else(|| {
            self.client_reference_id
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(TenantId::from)
        })
    }

    pub fn plan_id(&self) -> Option<PlanId> {
        self.metadata
            .get("planId")
            .filter(|s| !s.is_empty())
            .map(|s| PlanId::from(s.as_str()))
    }

    pub fn price_ref(&self) -> Option<&str> {
        self.metadata.get("priceId").map(String::as_str)
    }

    pub fn billing_cycle(&self) -> Option<BillingCycle> {
        self.metadata.get("billingCycle").and_then(|s| s.parse().ok())
    }
}

fn tenant_from(metadata: &HashMap<String, String>) -> Option<TenantId> {
    ["tenantId", "userId"]
        .iter()
        .filter_map(|k| metadata.get(*k))
        .find(|s| !s.is_empty())
        .map(|s| TenantId::from(s.as_str()))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceRef>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ItemList<T> {
    #[serde(default)]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub items: ItemList<SubscriptionItem>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    /// Price of the first subscription item.
    pub fn price_ref(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.as_str())
    }

    /// Current period, read from the subscription or, on newer API
    /// versions, from its first item.
    pub fn period(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let item = self.items.data.first();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start))?;
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end))?;
        Some((timestamp(start)?, timestamp(end)?))
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        tenant_from(&self.metadata)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LinePeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<LinePeriod>,
    #[serde(default)]
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub lines: ItemList<InvoiceLine>,
}

impl InvoiceObject {
    /// Latest service period covered by the invoice lines.
    pub fn line_period(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let period = self
            .lines
            .data
            .iter()
            .filter_map(|l| l.period.as_ref())
            .max_by_key(|p| p.end)?;
        Some((timestamp(period.start)?, timestamp(period.end)?))
    }

    pub fn price_ref(&self) -> Option<&str> {
        self.lines
            .data
            .iter()
            .find_map(|l| l.price.as_ref())
            .map(|p| p.id.as_str())
    }
}
