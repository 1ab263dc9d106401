//! Registry of tenant-owned cloned voices.

mod clone;

pub use clone::{SampleMetadata, TrainingStatus, VoiceClone};

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::provider::AudioOpProvider;
use crate::store::{Store, StoreError, StoreResult};
use crate::types::{SharedClock, TenantId};

#[derive(Clone)]
pub struct VoiceRegistry {
    store: Arc<dyn Store>,
    clock: SharedClock,
}

impl VoiceRegistry {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn register(
        &self,
        tenant: &TenantId,
        name: &str,
        description: Option<String>,
        provider_voice_id: &str,
        sample: SampleMetadata,
    ) -> StoreResult<VoiceClone> {
        let clone = VoiceClone::new(
            tenant.clone(),
            name,
            provider_voice_id,
            sample,
            self.clock.now(),
        )
        .with_description(description);
        self.store.insert_clone(&clone).await?;
        info!(tenant_id = %tenant, voice_id = provider_voice_id, "Voice clone registered");
        Ok(clone)
    }

    pub async fn list(&self, tenant: &TenantId) -> StoreResult<Vec<VoiceClone>> {
        self.store.list_clones(tenant).await
    }

    pub async fn get(&self, tenant: &TenantId, id: Uuid) -> StoreResult<Option<VoiceClone>> {
        self.store.get_clone(tenant, id).await
    }

    pub async fn find_by_voice(
        &self,
        tenant: &TenantId,
        provider_voice_id: &str,
    ) -> StoreResult<Option<VoiceClone>> {
        self.store.clone_by_provider_voice(tenant, provider_voice_id).await
    }

    /// Whether `voice_id` is one of the tenant's own clones that finished
    /// training.
    pub async fn owns_ready_voice(&self, tenant: &TenantId, voice_id: &str) -> StoreResult<bool> {
        Ok(self
            .find_by_voice(tenant, voice_id)
            .await?
            .is_some_and(|c| c.status == TrainingStatus::Ready))
    }

    /// Apply a training status. Only `training -> ready | failed` moves;
    /// repeating the current status is a no-op.
    pub async fn set_status(
        &self,
        tenant: &TenantId,
        id: Uuid,
        status: TrainingStatus,
    ) -> StoreResult<VoiceClone> {
        self.store
            .set_clone_status(tenant, id, status, self.clock.now())
            .await?
            .ok_or_else(|| StoreError::not_found(format!("voice clone {}", id)))
    }

    /// Poll the provider for a clone still in training.
    pub async fn refresh(
        &self,
        tenant: &TenantId,
        provider_voice_id: &str,
        provider: &dyn AudioOpProvider,
    ) -> StoreResult<VoiceClone> {
        let clone = self
            .find_by_voice(tenant, provider_voice_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("voice clone {}", provider_voice_id)))?;
        if clone.status.is_terminal() {
            return Ok(clone);
        }
        match provider.voice_status(provider_voice_id).await {
            Ok(status) => self.set_status(tenant, clone.id, status).await,
            Err(e) => {
                warn!(
                    tenant_id = %tenant,
                    voice_id = provider_voice_id,
                    error = %e,
                    "Could not refresh voice clone status"
                );
                Ok(clone)
            }
        }
    }

    pub async fn delete(&self, tenant: &TenantId, provider_voice_id: &str) -> StoreResult<bool> {
        let Some(clone) = self.find_by_voice(tenant, provider_voice_id).await? else {
            return Ok(false);
        };
        let deleted = self.store.delete_clone(tenant, clone.id).await?;
        if deleted {
            info!(tenant_id = %tenant, voice_id = provider_voice_id, "Voice clone deleted");
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for VoiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRegistry")
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::store::MemoryStore;
    use crate::types::system_clock;

    fn registry() -> VoiceRegistry {
        VoiceRegistry::new(Arc::new(MemoryStore::new()), system_clock())
    }

    #[tokio::test]
    async fn test_register_and_refresh() {
        let registry = registry();
        let tenant = TenantId::from("t1");
        registry
            .register(&tenant, "Mine", None, "cl_1", SampleMetadata::default())
            .await
            .unwrap();

        assert!(!registry.owns_ready_voice(&tenant, "cl_1").await.unwrap());
        let refreshed = registry
            .refresh(&tenant, "cl_1", &ScriptedProvider::new())
            .await
            .unwrap();
        assert_eq!(refreshed.status, TrainingStatus::Ready);
        assert!(registry.owns_ready_voice(&tenant, "cl_1").await.unwrap());
        assert!(!registry
            .owns_ready_voice(&TenantId::from("t2"), "cl_1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let registry = registry();
        let tenant = TenantId::from("t1");
        let clone = registry
            .register(&tenant, "Mine", None, "cl_1", SampleMetadata::default())
            .await
            .unwrap();

        registry
            .set_status(&tenant, clone.id, TrainingStatus::Failed)
            .await
            .unwrap();
        let again = registry
            .set_status(&tenant, clone.id, TrainingStatus::Failed)
            .await
            .unwrap();
        assert_eq!(again.status, TrainingStatus::Failed);
        assert!(matches!(
            registry
                .set_status(&tenant, clone.id, TrainingStatus::Ready)
                .await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_by_voice_id() {
        let registry = registry();
        let tenant = TenantId::from("t1");
        registry
            .register(&tenant, "Mine", None, "cl_1", SampleMetadata::default())
            .await
            .unwrap();

        assert!(!registry.delete(&TenantId::from("t2"), "cl_1").await.unwrap());
        assert!(registry.delete(&tenant, "cl_1").await.unwrap());
        assert!(registry.list(&tenant).await.unwrap().is_empty());
    }
}
