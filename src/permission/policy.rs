use super::{Action, Role};
use crate::entity::EntityType;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Injected `(role, entityType, action) -> allowed` table.
///
/// A missing entry is not a denial by itself: an organization admin is
/// implicitly granted product-entity access unless an entry narrows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTable {
    entries: HashMap<(Role, EntityType, Action), bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRule {
    role: Role,
    entity_type: EntityType,
    actions: BTreeMap<Action, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyDocument {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, role: Role, entity_type: EntityType, actions: &[Action]) -> Self {
        for action in actions {
            self.entries.insert((role, entity_type, *action), true);
        }
        self
    }

    pub fn deny(mut self, role: Role, entity_type: EntityType, actions: &[Action]) -> Self {
        for action in actions {
            self.entries.insert((role, entity_type, *action), false);
        }
        self
    }

    pub fn lookup(&self, role: Role, entity_type: EntityType, action: Action) -> Option<bool> {
        self.entries.get(&(role, entity_type, action)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses `{"rules": [{"role", "entityType", "actions": {action: bool}}]}`.
    /// Later rules override earlier ones for the same triple.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let doc: PolicyDocument = serde_json::from_str(raw).map_err(|e| CoreError::InvalidConfig {
            message: format!("policy table: {e}"),
        })?;
        let mut table = PolicyTable::new();
        for rule in doc.rules {
            for (action, allowed) in rule.actions {
                table
                    .entries
                    .insert((rule.role, rule.entity_type, action), allowed);
            }
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| CoreError::InvalidConfig {
            message: format!("read policy table {}: {e}", path.display()),
        })?;
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        let mut grouped: BTreeMap<(Role, EntityType), BTreeMap<Action, bool>> = BTreeMap::new();
        for ((role, entity_type, action), allowed) in &self.entries {
            grouped
                .entry((*role, *entity_type))
                .or_default()
                .insert(*action, *allowed);
        }
        let doc = PolicyDocument {
            rules: grouped
                .into_iter()
                .map(|((role, entity_type), actions)| PolicyRule {
                    role,
                    entity_type,
                    actions,
                })
                .collect(),
        };
        serde_json::to_string_pretty(&doc).map_err(|e| CoreError::Internal(e.to_string()))
    }

    /// Baseline table for the product suite.
    pub fn product_default() -> Self {
        use Action::*;
        use EntityType::*;
        PolicyTable::new()
            .allow(Role::Admin, Organization, &[Read, Update, Delete])
            .deny(Role::Admin, Organization, &[Create])
            .allow(Role::Admin, Project, &[Create, Read, Update, Delete])
            .allow(Role::Admin, Task, &[Create, Read, Update, Delete])
            .allow(Role::Admin, Attachment, &[Create, Read, Update, Delete])
            .allow(Role::Member, Organization, &[Read])
            .allow(Role::Member, Project, &[Read])
            .allow(Role::Member, Task, &[Create, Read, Update, Delete])
            .allow(Role::Member, Attachment, &[Create, Read])
            .deny(Role::Member, Attachment, &[Update, Delete])
            .allow(Role::Guest, Organization, &[Read])
            .allow(Role::Guest, Project, &[Read])
            .allow(Role::Guest, Task, &[Read])
            .allow(Role::Guest, Attachment, &[Read])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_rules_load_and_later_rules_override() {
        let table = PolicyTable::from_json(
            r#"{"rules": [
                {"role": "member", "entityType": "task", "actions": {"read": true, "delete": true}},
                {"role": "member", "entityType": "task", "actions": {"delete": false}}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(
            table.lookup(Role::Member, EntityType::Task, Action::Read),
            Some(true)
        );
        assert_eq!(
            table.lookup(Role::Member, EntityType::Task, Action::Delete),
            Some(false)
        );
        assert_eq!(
            table.lookup(Role::Member, EntityType::Task, Action::Update),
            None
        );
    }

    #[test]
    fn malformed_policy_is_invalid_config() {
        let err = PolicyTable::from_json(r#"{"rules": [{"role": "owner"}]}"#).expect_err("bad");
        assert_eq!(err.code_str(), "invalid_config");
    }

    #[test]
    fn serialized_table_parses_back_identically() {
        let table = PolicyTable::product_default();
        let json = table.to_json().expect("encode");
        assert_eq!(PolicyTable::from_json(&json).expect("decode"), table);
    }

    #[test]
    fn load_reads_table_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"rules": [{"role": "guest", "entityType": "project", "actions": {"read": true}}]}"#,
        )
        .expect("write");
        let table = PolicyTable::load(&path).expect("load");
        assert_eq!(table.len(), 1);
        assert!(PolicyTable::load(&dir.path().join("missing.json")).is_err());
    }
}
