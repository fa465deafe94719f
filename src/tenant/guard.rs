use super::Identity;
use crate::entity::EntityType;
use crate::error::{CoreError, ResourceType};
use crate::permission::{Membership, PermissionContext};
use tracing::{debug, error};

/// Output of the external authentication step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub user_id: String,
    pub memberships: Vec<Membership>,
    pub is_system_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStage {
    Anonymous,
    Authenticated,
    TenantBound,
    CrossTenant,
    OrganizationBound,
}

/// Request state threaded through
/// `auth_guard -> (tenant_guard | cross_tenant_guard) -> org_guard`.
///
/// Running a guard out of order is a programmer error and fails fast with
/// `Unauthorized`.
#[derive(Debug, Clone)]
pub struct GuardState {
    stage: GuardStage,
    identity: Option<Identity>,
    memberships: Vec<Membership>,
    tenant_id: Option<String>,
    organization_id: Option<String>,
}

impl Default for GuardState {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardState {
    pub fn new() -> Self {
        Self {
            stage: GuardStage::Anonymous,
            identity: None,
            memberships: Vec::new(),
            tenant_id: None,
            organization_id: None,
        }
    }

    pub fn stage(&self) -> GuardStage {
        self.stage
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn memberships(&self) -> &[Membership] {
        &self.memberships
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    fn expect_stage(&self, guard: &str, allowed: &[GuardStage]) -> Result<(), CoreError> {
        if allowed.contains(&self.stage) {
            return Ok(());
        }
        error!(guard, stage = ?self.stage, "guard ordering violated");
        Err(CoreError::Unauthorized(format!(
            "{guard} cannot run at stage {:?}",
            self.stage
        )))
    }

    pub fn auth_guard(mut self, session: Option<ResolvedSession>) -> Result<Self, CoreError> {
        self.expect_stage("auth_guard", &[GuardStage::Anonymous])?;
        let Some(session) = session else {
            return Err(CoreError::Unauthorized("no valid session".into()));
        };
        let identity = Identity::from_memberships(
            session.user_id,
            &session.memberships,
            session.is_system_admin,
        );
        debug!(user_id = %identity.user_id, "request authenticated");
        self.identity = Some(identity);
        self.memberships = session.memberships;
        self.stage = GuardStage::Authenticated;
        Ok(self)
    }

    pub fn tenant_guard(mut self, tenant_id: &str) -> Result<Self, CoreError> {
        let identity = self.require_identity("tenant_guard")?;
        self.expect_stage("tenant_guard", &[GuardStage::Authenticated])?;
        if !identity.belongs_to(tenant_id) {
            return Err(CoreError::forbidden(ResourceType::Tenant, tenant_id, "access"));
        }
        self.tenant_id = Some(tenant_id.to_string());
        self.stage = GuardStage::TenantBound;
        Ok(self)
    }

    /// For routes whose tenant is derived from the target entity later on.
    /// Needs an identity from `auth_guard`.
    pub fn cross_tenant_guard(mut self) -> Result<Self, CoreError> {
        self.require_identity("cross_tenant_guard")?;
        self.expect_stage("cross_tenant_guard", &[GuardStage::Authenticated])?;
        self.stage = GuardStage::CrossTenant;
        Ok(self)
    }

    pub fn org_guard(mut self, organization_id: &str) -> Result<Self, CoreError> {
        let identity = self.require_identity("org_guard")?.clone();
        self.expect_stage(
            "org_guard",
            &[GuardStage::TenantBound, GuardStage::CrossTenant],
        )?;
        let membership = self.memberships.iter().find(|m| {
            m.is_active()
                && m.context_type == EntityType::Organization
                && m.context_id == organization_id
                && self.tenant_id.as_deref().is_none_or(|t| t == m.tenant_id)
        });
        match membership {
            Some(m) => {
                if self.tenant_id.is_none() {
                    self.tenant_id = Some(m.tenant_id.clone());
                }
            }
            None if identity.is_system_admin => {}
            None => {
                return Err(CoreError::forbidden(
                    EntityType::Organization,
                    organization_id,
                    "access",
                ));
            }
        }
        self.organization_id = Some(organization_id.to_string());
        self.stage = GuardStage::OrganizationBound;
        Ok(self)
    }

    fn require_identity(&self, guard: &str) -> Result<&Identity, CoreError> {
        self.identity.as_ref().ok_or_else(|| {
            error!(guard, "guard ran before auth_guard resolved an identity");
            CoreError::Unauthorized(format!("{guard} requires a resolved identity"))
        })
    }

    /// Input for the permission engine.
    pub fn permission_context(&self) -> Result<PermissionContext, CoreError> {
        let identity = self.require_identity("permission_context")?;
        Ok(PermissionContext {
            user_id: identity.user_id.clone(),
            memberships: self.memberships.clone(),
            is_system_admin: identity.is_system_admin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Role;

    fn session() -> ResolvedSession {
        ResolvedSession {
            user_id: "u1".into(),
            memberships: vec![Membership::organization("u1", "tenant_a", "o1", Role::Member)],
            is_system_admin: false,
        }
    }

    #[test]
    fn full_chain_binds_tenant_and_organization() {
        let state = GuardState::new()
            .auth_guard(Some(session()))
            .and_then(|s| s.tenant_guard("tenant_a"))
            .and_then(|s| s.org_guard("o1"))
            .expect("guards pass");
        assert_eq!(state.stage(), GuardStage::OrganizationBound);
        assert_eq!(state.tenant_id(), Some("tenant_a"));
        assert_eq!(state.organization_id(), Some("o1"));
    }

    #[test]
    fn cross_tenant_guard_without_identity_fails_fast() {
        let err = GuardState::new()
            .cross_tenant_guard()
            .expect_err("ordering violation");
        assert_eq!(err.code_str(), "unauthorized");
    }

    #[test]
    fn org_guard_before_tenant_binding_is_an_ordering_violation() {
        let err = GuardState::new()
            .auth_guard(Some(session()))
            .and_then(|s| s.org_guard("o1"))
            .expect_err("ordering violation");
        assert_eq!(err.code_str(), "unauthorized");
    }

    #[test]
    fn missing_session_is_unauthorized() {
        let err = GuardState::new().auth_guard(None).expect_err("anonymous");
        assert_eq!(err.code_str(), "unauthorized");
    }

    #[test]
    fn foreign_tenant_is_forbidden() {
        let err = GuardState::new()
            .auth_guard(Some(session()))
            .and_then(|s| s.tenant_guard("tenant_b"))
            .expect_err("foreign tenant");
        assert_eq!(err.code_str(), "forbidden");
    }

    #[test]
    fn cross_tenant_route_takes_tenant_from_org_membership() {
        let state = GuardState::new()
            .auth_guard(Some(session()))
            .and_then(|s| s.cross_tenant_guard())
            .and_then(|s| s.org_guard("o1"))
            .expect("guards pass");
        assert_eq!(state.tenant_id(), Some("tenant_a"));
        let err = GuardState::new()
            .auth_guard(Some(session()))
            .and_then(|s| s.cross_tenant_guard())
            .and_then(|s| s.org_guard("o2"))
            .expect_err("not a member");
        assert_eq!(err.code_str(), "forbidden");
    }
}
