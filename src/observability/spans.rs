//! Tracing subscriber setup and structured spans.

use std::time::Instant;

use tracing::{Level, Span, field, span};
use tracing_subscriber::EnvFilter;

use crate::types::{OperationClass, TenantId};

#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".into(),
            json: false,
        }
    }
}

impl TracingConfig {
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

pub type TracingInitError = Box<dyn std::error::Error + Send + Sync>;

/// Install the global fmt subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

pub fn admission_span(tenant: &TenantId, operation: OperationClass) -> Span {
    span!(
        Level::INFO,
        "admission",
        tenant_id = %tenant,
        operation = operation.as_str(),
        cost = field::Empty,
        usage_id = field::Empty,
    )
}

pub fn billing_event_span(event_id: &str, event_type: &str) -> Span {
    span!(
        Level::INFO,
        "billing.event",
        event_id = event_id,
        event_type = event_type,
        outcome = field::Empty,
    )
}

/// Times one provider call inside its own span.
pub struct ProviderCallSpan {
    span: Span,
    start: Instant,
}

impl ProviderCallSpan {
    pub fn new(provider: &str, operation: OperationClass) -> Self {
        let span = span!(
            Level::INFO,
            "provider.call",
            provider = provider,
            operation = operation.as_str(),
            outcome = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record the outcome and return the elapsed milliseconds.
    pub fn finish(self, outcome: &str) -> f64 {
        let elapsed = self.start.elapsed();
        self.span.record("outcome", outcome);
        self.span.record("latency_ms", elapsed.as_millis() as u64);
        elapsed.as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_call_span_reports_latency() {
        let span = ProviderCallSpan::new("scripted", OperationClass::Tts);
        let ms = span.finish("succeeded");
        assert!(ms >= 0.0);
    }

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default().json(true);
        assert!(config.json);
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn test_spans_construct() {
        let _a = admission_span(&TenantId::from("t"), OperationClass::Stt);
        let _b = billing_event_span("evt_1", "invoice.paid");
    }
}
