//! Atomic metering metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::types::Tokens;

/// Metrics configuration.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MetricsConfig {
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

/// Thread-safe atomic counter.
#[derive(Default, Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Default, Debug)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram of millisecond latencies.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bounds: Vec<f64>,
    // Stored in microseconds to keep sub-millisecond precision.
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            bounds,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Buckets sized for provider calls, which run from tens of
    /// milliseconds to a minute.
    pub fn provider_latency() -> Self {
        Self::new(vec![
            50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
        ])
    }

    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_ms(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mean_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum_ms() / n as f64,
        }
    }

    /// Per-bucket counts, the last entry being the overflow bucket.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// How a provider call ended, from the ledger's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderCallOutcome {
    Succeeded,
    /// Definite failure; the reservation is refunded.
    Failed,
    /// Timed out or uncertain; the charge stands.
    Ambiguous,
}

/// What the reconciler did with a billing event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BillingDisposition {
    Applied,
    Duplicate,
    Ignored,
    Rejected,
    Unreconcilable,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    enabled: bool,
    pub reservations_granted: Counter,
    pub reservations_rejected: Counter,
    pub entitlement_denials: Counter,
    pub tokens_charged: Counter,
    pub tokens_refunded: Counter,
    pub provider_failures: Counter,
    pub provider_ambiguous: Counter,
    pub operations_in_flight: Gauge,
    pub provider_latency_ms: Histogram,
    pub billing_applied: Counter,
    pub billing_duplicate: Counter,
    pub billing_ignored: Counter,
    pub billing_rejected: Counter,
    pub billing_unreconcilable: Counter,
}

impl MetricsRegistry {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            enabled: config.enabled,
            reservations_granted: Counter::new(),
            reservations_rejected: Counter::new(),
            entitlement_denials: Counter::new(),
            tokens_charged: Counter::new(),
            tokens_refunded: Counter::new(),
            provider_failures: Counter::new(),
            provider_ambiguous: Counter::new(),
            operations_in_flight: Gauge::new(),
            provider_latency_ms: Histogram::provider_latency(),
            billing_applied: Counter::new(),
            billing_duplicate: Counter::new(),
            billing_ignored: Counter::new(),
            billing_rejected: Counter::new(),
            billing_unreconcilable: Counter::new(),
        }
    }

    pub fn record_reservation(&self, granted: bool, cost: Tokens) {
        if !self.enabled {
            return;
        }
        if granted {
            self.reservations_granted.inc();
            self.tokens_charged.add(cost as u64);
        } else {
            self.reservations_rejected.inc();
        }
    }

    pub fn record_refund(&self, amount: Tokens) {
        if self.enabled {
            self.tokens_refunded.add(amount as u64);
        }
    }

    pub fn record_entitlement_denied(&self) {
        if self.enabled {
            self.entitlement_denials.inc();
        }
    }

    pub fn record_provider_start(&self) {
        if self.enabled {
            self.operations_in_flight.inc();
        }
    }

    pub fn record_provider_end(&self, outcome: ProviderCallOutcome, latency_ms: f64) {
        if !self.enabled {
            return;
        }
        self.operations_in_flight.dec();
        self.provider_latency_ms.observe(latency_ms);
        match outcome {
            ProviderCallOutcome::Succeeded => {}
            ProviderCallOutcome::Failed => self.provider_failures.inc(),
            ProviderCallOutcome::Ambiguous => self.provider_ambiguous.inc(),
        }
    }

    pub fn record_billing_event(&self, disposition: BillingDisposition) {
        if !self.enabled {
            return;
        }
        match disposition {
            BillingDisposition::Applied => self.billing_applied.inc(),
            BillingDisposition::Duplicate => self.billing_duplicate.inc(),
            BillingDisposition::Ignored => self.billing_ignored.inc(),
            BillingDisposition::Rejected => self.billing_rejected.inc(),
            BillingDisposition::Unreconcilable => self.billing_unreconcilable.inc(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(&MetricsConfig::default())
    }
}

/// Point-in-time snapshot of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub reservations_granted: u64,
    pub reservations_rejected: u64,
    pub entitlement_denials: u64,
    pub tokens_charged: u64,
    pub tokens_refunded: u64,
    pub provider_failures: u64,
    pub provider_ambiguous: u64,
    pub operations_in_flight: i64,
    pub avg_provider_latency_ms: f64,
    pub billing_events_applied: u64,
    pub billing_events_duplicate: u64,
    pub billing_events_ignored: u64,
    pub billing_events_rejected: u64,
    pub billing_events_unreconcilable: u64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        Self {
            reservations_granted: registry.reservations_granted.get(),
            reservations_rejected: registry.reservations_rejected.get(),
            entitlement_denials: registry.entitlement_denials.get(),
            tokens_charged: registry.tokens_charged.get(),
            tokens_refunded: registry.tokens_refunded.get(),
            provider_failures: registry.provider_failures.get(),
            provider_ambiguous: registry.provider_ambiguous.get(),
            operations_in_flight: registry.operations_in_flight.get(),
            avg_provider_latency_ms: registry.provider_latency_ms.mean_ms(),
            billing_events_applied: registry.billing_applied.get(),
            billing_events_duplicate: registry.billing_duplicate.get(),
            billing_events_ignored: registry.billing_ignored.get(),
            billing_events_rejected: registry.billing_rejected.get(),
            billing_events_unreconcilable: registry.billing_unreconcilable.get(),
        }
    }
}
