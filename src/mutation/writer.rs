use super::resolve::{RowPatch, WriteMode, WriteOutcome, resolve_write};
use super::tx::{MutationMetadata, create_server_tx};
use crate::entity::EntityRef;
use crate::error::CoreError;
use crate::restrictions::QuotaGuard;
use crate::storage::{StorageBackend, StoredRow, now_micros};
use crate::tenant::TenantScope;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Writes tenant-scoped rows with their mutation metadata attached.
#[derive(Clone)]
pub struct RowWriter {
    storage: Arc<dyn StorageBackend>,
    quotas: QuotaGuard,
}

impl RowWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, quotas: QuotaGuard) -> Self {
        Self { storage, quotas }
    }

    /// Inserts a new row after reserving quota. `tx` is the client's metadata;
    /// `None` marks a system-originated write.
    pub fn create(
        &self,
        scope: &TenantScope,
        entity: EntityRef,
        fields: BTreeMap<String, serde_json::Value>,
        tx: Option<MutationMetadata>,
    ) -> Result<StoredRow, CoreError> {
        scope.ensure_visible(&entity)?;
        if let Some(field) = fields.keys().find(|f| !entity.entity_type.is_mutable_field(f)) {
            return Err(CoreError::Validation(format!(
                "field '{field}' is not a mutable field of {}",
                entity.entity_type
            )));
        }
        let tx = match tx {
            Some(client) => MutationMetadata {
                version: 1,
                field_versions: BTreeMap::new(),
                ..client
            },
            None => create_server_tx(),
        };

        self.quotas.reserve(&entity.tenant_id, entity.entity_type)?;
        let row = StoredRow {
            entity,
            fields,
            tx,
            updated_at: now_micros(),
        };
        if let Err(err) = self.storage.insert_row(row.clone()) {
            if let Err(release_err) = self
                .quotas
                .release(&row.entity.tenant_id, row.entity.entity_type)
            {
                warn!(error = %release_err, "failed to release quota after insert failure");
            }
            return Err(err);
        }
        Ok(row)
    }

    /// Applies `patch` under the optimistic-lock protocol. The version check
    /// and the write happen in one storage transaction.
    pub fn update(
        &self,
        scope: &TenantScope,
        patch: &RowPatch,
        mode: WriteMode,
    ) -> Result<WriteOutcome, CoreError> {
        patch.validate()?;
        let mut outcome = None;
        let result = self
            .storage
            .update_row(patch.entity_type, &patch.id, &mut |current: &StoredRow| {
                if !scope.permits(current.tenant_id()) {
                    return Err(CoreError::not_found(patch.entity_type, patch.id.clone()));
                }
                let resolved = resolve_write(current, patch, mode)?;
                let row = resolved.row.clone();
                outcome = Some(resolved);
                Ok(row)
            });
        match result {
            Ok(_) => outcome.ok_or_else(|| CoreError::Internal("write produced no outcome".into())),
            Err(err @ CoreError::Conflict(_)) => {
                info!(
                    entity_type = %patch.entity_type,
                    id = %patch.id,
                    source_id = %patch.tx.source_id,
                    version = patch.tx.version,
                    ?mode,
                    "write rejected as conflict"
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
