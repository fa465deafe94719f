use crate::entity::EntityType;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SERVER_SOURCE_ID: &str = "server";

/// Per-row mutation metadata (`tx` on the wire).
///
/// `version` is the whole-row optimistic-lock counter. `field_versions` holds
/// one monotonic counter per mutable field that has been written at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationMetadata {
    pub id: String,
    pub source_id: String,
    pub version: u64,
    #[serde(default)]
    pub field_versions: BTreeMap<String, u64>,
}

impl MutationMetadata {
    /// Client-side metadata for a write based on `last_known_version`.
    pub fn client(source_id: impl Into<String>, last_known_version: u64) -> Self {
        Self {
            id: new_tx_id(),
            source_id: source_id.into(),
            version: last_known_version,
            field_versions: BTreeMap::new(),
        }
    }

    pub fn with_field_version(mut self, field: impl Into<String>, version: u64) -> Self {
        self.field_versions.insert(field.into(), version);
        self
    }

    pub fn field_version(&self, field: &str) -> u64 {
        self.field_versions.get(field).copied().unwrap_or(0)
    }

    pub fn is_server_originated(&self) -> bool {
        self.source_id == SERVER_SOURCE_ID
    }

    /// Rejects field names that are not mutable fields of `entity_type`.
    pub fn validate_fields(&self, entity_type: EntityType) -> Result<(), CoreError> {
        if let Some(field) = self
            .field_versions
            .keys()
            .find(|f| !entity_type.is_mutable_field(f))
        {
            return Err(CoreError::Validation(format!(
                "field '{field}' is not a mutable field of {entity_type}"
            )));
        }
        Ok(())
    }
}

/// Metadata for system-originated writes (seeds, imports) that bypass the
/// optimistic-lock flow.
pub fn create_server_tx() -> MutationMetadata {
    MutationMetadata {
        id: new_tx_id(),
        source_id: SERVER_SOURCE_ID.to_string(),
        version: 1,
        field_versions: BTreeMap::new(),
    }
}

pub(crate) fn new_tx_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_tx_starts_at_version_one_without_field_versions() {
        let tx = create_server_tx();
        assert_eq!(tx.source_id, "server");
        assert_eq!(tx.version, 1);
        assert!(tx.field_versions.is_empty());
        assert!(tx.is_server_originated());
    }

    #[test]
    fn wire_shape_uses_camel_case_keys() {
        let tx = MutationMetadata {
            id: "tx1".into(),
            source_id: "client-a".into(),
            version: 3,
            field_versions: BTreeMap::from([("summary".to_string(), 2)]),
        };
        let json = serde_json::to_value(&tx).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({
                "id": "tx1",
                "sourceId": "client-a",
                "version": 3,
                "fieldVersions": { "summary": 2 }
            })
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let tx = MutationMetadata::client("c", 1).with_field_version("owner_id", 1);
        let err = tx.validate_fields(EntityType::Task).expect_err("reject");
        assert_eq!(err.code_str(), "validation");
    }
}
