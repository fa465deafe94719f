use super::tx::MutationMetadata;
use crate::entity::EntityType;
use crate::error::CoreError;
use crate::storage::{StoredRow, now_micros};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client write against an existing row.
///
/// `tx.version` is the last row version the writer saw and `tx.field_versions`
/// carries a proposed counter for each field in `changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPatch {
    pub entity_type: EntityType,
    pub id: String,
    pub changes: BTreeMap<String, serde_json::Value>,
    pub tx: MutationMetadata,
}

impl RowPatch {
    pub fn new(entity_type: EntityType, id: impl Into<String>, tx: MutationMetadata) -> Self {
        Self {
            entity_type,
            id: id.into(),
            changes: BTreeMap::new(),
            tx,
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.changes.insert(field.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.changes.is_empty() {
            return Err(CoreError::Validation("patch changes no fields".into()));
        }
        if let Some(field) = self
            .changes
            .keys()
            .find(|f| !self.entity_type.is_mutable_field(f))
        {
            return Err(CoreError::Validation(format!(
                "field '{field}' is not a mutable field of {}",
                self.entity_type
            )));
        }
        self.tx.validate_fields(self.entity_type)?;
        if let Some(field) = self
            .tx
            .field_versions
            .keys()
            .find(|f| !self.changes.contains_key(*f))
        {
            return Err(CoreError::Validation(format!(
                "field version sent for unchanged field '{field}'"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    /// Accept only when the writer saw the current row version.
    WholeRow,
    /// Accept each field whose proposed counter is ahead of the server's.
    FieldMerge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The server already holds an equal or newer write for the field.
    StaleFieldVersion,
    /// Another source wrote the field at the same counter value.
    ConcurrentEdit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedField {
    pub field: String,
    pub reason: SkipReason,
    pub client_version: u64,
    pub server_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub row: StoredRow,
    pub applied: Vec<String>,
    pub skipped: Vec<SkippedField>,
}

/// Whole-row optimistic check.
pub fn check_row_version(
    server: &MutationMetadata,
    client: &MutationMetadata,
) -> Result<(), CoreError> {
    if client.version == server.version {
        return Ok(());
    }
    Err(CoreError::Conflict(format!(
        "row version mismatch: client based on {}, server at {}",
        client.version, server.version
    )))
}

/// Resolves `patch` against `current` and returns the row to store.
///
/// Must run inside the same storage transaction that persists the result.
pub fn resolve_write(
    current: &StoredRow,
    patch: &RowPatch,
    mode: WriteMode,
) -> Result<WriteOutcome, CoreError> {
    let server = &current.tx;
    let client = &patch.tx;

    let (accepted, skipped) = if check_row_version(server, client).is_ok() {
        (patch.changes.keys().cloned().collect::<Vec<_>>(), Vec::new())
    } else if mode == WriteMode::WholeRow {
        return Err(CoreError::Conflict(format!(
            "{} '{}' changed since version {} (now {})",
            patch.entity_type, patch.id, client.version, server.version
        )));
    } else {
        merge_fields(server, patch)
    };

    if accepted.is_empty() {
        return Err(CoreError::Conflict(format!(
            "{} '{}' has no field ahead of the server at version {}",
            patch.entity_type, patch.id, server.version
        )));
    }

    let mut row = current.clone();
    for field in &accepted {
        if let Some(value) = patch.changes.get(field) {
            row.fields.insert(field.clone(), value.clone());
        }
        let next = server.field_version(field) + 1;
        row.tx.field_versions.insert(field.clone(), next);
    }
    row.tx.version = server.version + 1;
    row.tx.id = client.id.clone();
    row.tx.source_id = client.source_id.clone();
    row.updated_at = now_micros();

    Ok(WriteOutcome {
        row,
        applied: accepted,
        skipped,
    })
}

fn merge_fields(server: &MutationMetadata, patch: &RowPatch) -> (Vec<String>, Vec<SkippedField>) {
    let mut accepted = Vec::new();
    let mut skipped = Vec::new();
    for field in patch.changes.keys() {
        let client_version = patch.tx.field_version(field);
        let server_version = server.field_version(field);
        if client_version > server_version {
            accepted.push(field.clone());
            continue;
        }
        let reason = if client_version == server_version && server.source_id != patch.tx.source_id
        {
            SkipReason::ConcurrentEdit
        } else {
            SkipReason::StaleFieldVersion
        };
        skipped.push(SkippedField {
            field: field.clone(),
            reason,
            client_version,
            server_version,
        });
    }
    (accepted, skipped)
}
