//! HTTP surface: metered operations, read endpoints and the billing webhook.

mod error;
mod handlers;
mod tenant;
mod webhook;

pub use error::ApiError;
pub use tenant::{HeaderTenantResolver, Tenant, TenantResolver};

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::config::settings::DEFAULT_BODY_LIMIT_BYTES;
use crate::service::MeteringService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MeteringService>,
    pub tenants: Arc<dyn TenantResolver>,
    pub body_limit: usize,
}

impl AppState {
    pub fn new(service: Arc<MeteringService>) -> Self {
        Self {
            service,
            tenants: Arc::new(HeaderTenantResolver::default()),
            body_limit: DEFAULT_BODY_LIMIT_BYTES,
        }
    }

    pub fn from_settings(service: Arc<MeteringService>, settings: &Settings) -> Self {
        Self {
            service,
            tenants: Arc::new(HeaderTenantResolver::new(settings.auth.tenant_header.clone())),
            body_limit: settings.server.body_limit_bytes,
        }
    }

    pub fn with_tenants(mut self, tenants: Arc<dyn TenantResolver>) -> Self {
        self.tenants = tenants;
        self
    }
}

/// The billing webhook route exists only when a webhook secret is set.
pub fn router(state: AppState) -> Router {
    let mut routes: Router<AppState> = Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/plans", get(handlers::plans))
        .route("/api/ai/text-to-speech", post(handlers::text_to_speech))
        .route("/api/ai/speech-to-text", post(handlers::speech_to_text))
        .route("/api/ai/voice-clone", post(handlers::voice_clone))
        .route("/api/user/usage", get(handlers::usage))
        .route("/api/user/subscription", get(handlers::subscription))
        .route("/api/user/entitlements", get(handlers::entitlements))
        .route("/api/user/voice-clones", get(handlers::list_voice_clones))
        .route(
            "/api/user/voice-clones/:id",
            get(handlers::get_voice_clone).delete(handlers::delete_voice_clone),
        );
    if state.service.webhooks_enabled() {
        routes = routes.route("/api/webhooks/billing", post(webhook::billing_webhook));
    }
    routes
        .layer(DefaultBodyLimit::max(state.body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
