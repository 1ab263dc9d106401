//! Structured logging, spans and metering metrics.

mod metrics;
mod spans;

pub use metrics::{
    BillingDisposition, Counter, Gauge, Histogram, MetricsConfig, MetricsRegistry,
    MetricsSummary, ProviderCallOutcome,
};
pub use spans::{
    ProviderCallSpan, TracingConfig, TracingInitError, admission_span, billing_event_span,
    init_tracing,
};

use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct ObservabilityConfig {
    pub tracing: TracingConfig,
    pub metrics: MetricsConfig,
}

impl ObservabilityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracing(mut self, config: TracingConfig) -> Self {
        self.tracing = config;
        self
    }

    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.metrics = config;
        self
    }

    pub fn build_registry(&self) -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new(&self.metrics))
    }
}
