//! Policy-driven authorization.
//!
//! Decisions are pure functions of pre-fetched memberships and resolved
//! entities. Resolving entities is the only I/O and happens before the
//! decision step (see [`PermissionEngine::split_by_permission`]).

pub mod engine;
pub mod policy;

use crate::entity::{EntityRef, EntityType};
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use engine::{CapabilityMap, PermissionEngine, SplitResult};
pub use policy::PolicyTable;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
    Guest,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Admin, Role::Member, Role::Guest];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown role '{s}'")))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Create, Action::Read, Action::Update, Action::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subject's relation to one context entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: String,
    pub tenant_id: String,
    pub context_type: EntityType,
    pub context_id: String,
    pub organization_id: String,
    pub role: Role,
    /// Invitation not yet accepted. Pending memberships grant nothing.
    #[serde(default)]
    pub pending: bool,
    /// Archived memberships grant nothing either.
    #[serde(default)]
    pub archived: bool,
}

impl Membership {
    pub fn organization(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
        role: Role,
    ) -> Self {
        let organization_id = organization_id.into();
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            context_type: EntityType::Organization,
            context_id: organization_id.clone(),
            organization_id,
            role,
            pending: false,
            archived: false,
        }
    }

    pub fn project(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            context_type: EntityType::Project,
            context_id: project_id.into(),
            organization_id: organization_id.into(),
            role,
            pending: false,
            archived: false,
        }
    }

    pub fn into_pending(mut self) -> Self {
        self.pending = true;
        self
    }

    pub fn is_active(&self) -> bool {
        !self.pending && !self.archived
    }
}

/// Resolved caller, as supplied by the guard pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionContext {
    pub user_id: String,
    pub memberships: Vec<Membership>,
    pub is_system_admin: bool,
}

impl PermissionContext {
    pub fn new(user_id: impl Into<String>, memberships: Vec<Membership>) -> Self {
        Self {
            user_id: user_id.into(),
            memberships,
            is_system_admin: false,
        }
    }

    pub fn system_admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            memberships: Vec::new(),
            is_system_admin: true,
        }
    }

    /// Role of the nearest active membership along `entity`'s context chain.
    pub fn role_at(&self, entity: &EntityRef) -> Option<Role> {
        entity.context_chain().iter().find_map(|hop| {
            self.memberships
                .iter()
                .find(|m| {
                    m.is_active()
                        && m.tenant_id == entity.tenant_id
                        && m.context_type == hop.entity_type
                        && m.context_id == hop.id
                })
                .map(|m| m.role)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub is_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionDecision {
    Single(Decision),
    /// Exhaustive over the requested ids.
    Batch { results: BTreeMap<String, Decision> },
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        match self {
            PermissionDecision::Single(d) => d.is_allowed,
            PermissionDecision::Batch { results } => results.values().all(|d| d.is_allowed),
        }
    }

    pub fn allowed_for(&self, id: &str) -> Option<bool> {
        match self {
            PermissionDecision::Single(_) => None,
            PermissionDecision::Batch { results } => results.get(id).map(|d| d.is_allowed),
        }
    }
}
