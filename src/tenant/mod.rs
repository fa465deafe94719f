//! Tenant isolation: the guard chain that resolves who is calling, and the
//! scoped execution context every read and write of a request runs inside.

pub mod guard;
pub mod scope;

use crate::permission::Membership;
use crate::storage::Visibility;
use std::collections::BTreeSet;

pub use guard::{GuardStage, GuardState, ResolvedSession};
pub use scope::{IsolationStrategy, TenantContextSwitcher, TenantScope};

/// Identity bound to a tenant scope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub user_id: String,
    pub tenant_ids: BTreeSet<String>,
    pub is_system_admin: bool,
}

impl Identity {
    /// Tenants are derived from active memberships only.
    pub fn from_memberships(
        user_id: impl Into<String>,
        memberships: &[Membership],
        is_system_admin: bool,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_ids: memberships
                .iter()
                .filter(|m| m.is_active())
                .map(|m| m.tenant_id.clone())
                .collect(),
            is_system_admin,
        }
    }

    pub fn visibility(&self) -> Visibility {
        Visibility {
            user_id: self.user_id.clone(),
            tenant_ids: self.tenant_ids.clone(),
            unrestricted: self.is_system_admin,
        }
    }

    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.is_system_admin || self.tenant_ids.contains(tenant_id)
    }
}
