pub mod coalesce;
pub mod config;
pub mod counter;
pub mod entity;
pub mod error;
pub mod mutation;
pub mod permission;
pub mod restrictions;
pub mod sequencer;
pub mod storage;
pub mod tenant;

use crate::coalesce::RequestCoalescer;
use crate::config::CoreConfig;
use crate::counter::CounterStore;
use crate::entity::{EntityRef, EntityType};
use crate::error::CoreError;
use crate::mutation::{MutationMetadata, RowPatch, RowWriter, WriteMode, WriteOutcome};
use crate::permission::{Action, PermissionContext, PermissionEngine, Role, SplitResult};
use crate::restrictions::{QuotaGuard, RateLimiter, RestrictionsRegistry};
use crate::sequencer::{ChangeEvent, ContextSequencer};
use crate::storage::{StorageBackend, StoredRow};
use crate::tenant::{TenantContextSwitcher, TenantScope};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub use crate::config::RlsMode;
pub use crate::error::{ErrorCode, ResourceType};

/// Key of a coalesced row read.
pub type RowKey = (EntityType, String);

/// A configured consistency and permission core over one storage backend.
pub struct Tessera {
    storage: Arc<dyn StorageBackend>,
    counters: CounterStore,
    quotas: QuotaGuard,
    rate_limiter: RateLimiter,
    sequencer: ContextSequencer,
    permissions: PermissionEngine,
    switcher: TenantContextSwitcher,
    writer: RowWriter,
    reads: RequestCoalescer<RowKey, Option<StoredRow>>,
}

impl Tessera {
    pub fn open(config: CoreConfig, storage: Arc<dyn StorageBackend>) -> Result<Self, CoreError> {
        config.validate()?;
        let registry = Arc::new(RestrictionsRegistry::new(config.default_restrictions.clone()));
        for (tenant_id, restrictions) in &config.tenant_restrictions {
            registry.set(tenant_id.clone(), restrictions.clone());
        }
        let counters = CounterStore::new(Arc::clone(&storage));
        let quotas = QuotaGuard::new(counters.clone(), Arc::clone(&registry));
        let rate_limiter = RateLimiter::new(counters.clone(), registry, config.rate_limit_window);
        let switcher = TenantContextSwitcher::new(Arc::clone(&storage), config.rls_mode)?;
        info!(
            rls_mode = ?config.rls_mode,
            strategy = ?switcher.strategy(),
            tenant_overrides = config.tenant_restrictions.len(),
            "core opened"
        );
        Ok(Self {
            sequencer: ContextSequencer::new(Arc::clone(&storage)),
            permissions: PermissionEngine::new(config.policy),
            writer: RowWriter::new(Arc::clone(&storage), quotas.clone()),
            reads: RequestCoalescer::with_warn_threshold(config.coalescer_warn_inflight),
            storage,
            counters,
            quotas,
            rate_limiter,
            switcher,
        })
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    pub fn quotas(&self) -> &QuotaGuard {
        &self.quotas
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn sequencer(&self) -> &ContextSequencer {
        &self.sequencer
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn switcher(&self) -> &TenantContextSwitcher {
        &self.switcher
    }

    pub fn writer(&self) -> &RowWriter {
        &self.writer
    }

    pub fn reads(&self) -> &RequestCoalescer<RowKey, Option<StoredRow>> {
        &self.reads
    }

    /// Reads one row through the coalescer. Concurrent readers of the same
    /// row share a single storage fetch; each then applies its own scope and
    /// permission check, so a row hidden from the caller reads as `NotFound`.
    pub async fn read_entity(
        &self,
        scope: &TenantScope,
        ctx: &PermissionContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<StoredRow, CoreError> {
        let storage = Arc::clone(&self.storage);
        let fetch_id = id.to_string();
        let row = self
            .reads
            .coalesce((entity_type, id.to_string()), move || async move {
                storage.fetch_row(entity_type, &fetch_id, None)
            })
            .await?;
        let row = scope
            .filter_visible(row)
            .ok_or_else(|| CoreError::not_found(entity_type, id))?;
        self.permissions
            .can_access_entity(ctx, Action::Read, &row.entity)?;
        Ok(row)
    }

    /// Creates `entity` under `parent` once the caller may create its type
    /// there. The entity's ownership ids must name `parent`. A new context
    /// entity gets its counter row seeded with the creator counted under the
    /// role they hold at `parent`.
    pub fn create_entity(
        &self,
        scope: &TenantScope,
        ctx: &PermissionContext,
        parent: &EntityRef,
        entity: EntityRef,
        fields: BTreeMap<String, serde_json::Value>,
        tx: Option<MutationMetadata>,
    ) -> Result<StoredRow, CoreError> {
        if entity.tenant_id != parent.tenant_id {
            return Err(CoreError::Validation(format!(
                "{} '{}' must share its parent's tenant",
                entity.entity_type, entity.id
            )));
        }
        if !entity.is_linked_to(parent) {
            return Err(CoreError::Validation(format!(
                "{} '{}' does not belong to {} '{}'",
                entity.entity_type, entity.id, parent.entity_type, parent.id
            )));
        }
        scope.ensure_visible(parent)?;
        self.permissions.can_create(ctx, entity.entity_type, parent)?;
        let row = self.writer.create(scope, entity, fields, tx)?;
        if row.entity.entity_type.is_context() {
            // System admins hold no membership and count as admin.
            let creator_role = ctx.role_at(parent).unwrap_or(Role::Admin);
            self.sequencer.init_context_counters(
                row.entity.entity_type,
                std::slice::from_ref(&row.entity.id),
                creator_role,
            )?;
        }
        Ok(row)
    }

    /// Applies `patch` after an update permission check on the stored row.
    pub fn update_entity(
        &self,
        scope: &TenantScope,
        ctx: &PermissionContext,
        patch: &RowPatch,
        mode: WriteMode,
    ) -> Result<WriteOutcome, CoreError> {
        let current = scope
            .fetch(patch.entity_type, &patch.id)?
            .ok_or_else(|| CoreError::not_found(patch.entity_type, patch.id.clone()))?;
        self.permissions
            .can_access_entity(ctx, Action::Update, &current.entity)?;
        self.writer.update(scope, patch, mode)
    }

    pub fn split_by_permission(
        &self,
        ctx: &PermissionContext,
        action: Action,
        entity_type: EntityType,
        ids: &[String],
    ) -> SplitResult {
        self.permissions
            .split_by_permission(ctx, action, entity_type, ids, self.storage.as_ref())
    }

    /// Feeds one committed change to the sequencer. Only the change-feed
    /// consumer calls this.
    pub fn record_change(&self, event: &ChangeEvent) -> Result<u64, CoreError> {
        self.sequencer.apply_change(event)
    }
}
