//! Tenant identity for incoming requests.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName};

use super::{ApiError, AppState};
use crate::config::settings::DEFAULT_TENANT_HEADER;
use crate::types::TenantId;

/// Maps an authenticated request to its tenant. Authentication itself
/// happens upstream.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<TenantId>;
}

/// Reads the tenant id from a header set by the upstream auth layer.
#[derive(Debug, Clone)]
pub struct HeaderTenantResolver {
    header: HeaderName,
}

impl HeaderTenantResolver {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for HeaderTenantResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static(DEFAULT_TENANT_HEADER))
    }
}

impl TenantResolver for HeaderTenantResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<TenantId> {
        let value = headers.get(&self.header)?.to_str().ok()?.trim();
        (!value.is_empty()).then(|| TenantId::from(value))
    }
}

/// Extractor for the request's tenant; rejects with 401.
#[derive(Debug, Clone)]
pub struct Tenant(pub TenantId);

#[async_trait]
impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state
            .tenants
            .resolve(&parts.headers)
            .map(Tenant)
            .ok_or(ApiError::Unauthorized)
    }
}
