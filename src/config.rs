use crate::error::CoreError;
use crate::permission::PolicyTable;
use crate::restrictions::Restrictions;
use std::collections::HashMap;
use std::time::Duration;

/// How tenant scopes enforce row visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RlsMode {
    /// Use native row-level security when the backend has it, else filter in
    /// the application.
    #[default]
    Auto,
    /// Require native row-level security; startup fails without it.
    Native,
    /// Always filter in the application.
    ApplicationFilter,
}

/// Runtime configuration for a [`crate::Tessera`] instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub rls_mode: RlsMode,
    pub policy: PolicyTable,
    pub default_restrictions: Restrictions,
    pub tenant_restrictions: HashMap<String, Restrictions>,
    /// Window over which `rateLimits.apiPointsPerHour` is charged.
    pub rate_limit_window: Duration,
    /// In-flight coalesced fetches above which a warning is logged.
    pub coalescer_warn_inflight: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rls_mode: RlsMode::Auto,
            policy: PolicyTable::product_default(),
            default_restrictions: Restrictions::default(),
            tenant_restrictions: HashMap::new(),
            rate_limit_window: Duration::from_secs(3600),
            coalescer_warn_inflight: 10_000,
        }
    }
}

impl CoreConfig {
    /// Requires native row-level security from the backend.
    pub fn production() -> Self {
        Self {
            rls_mode: RlsMode::Native,
            ..Self::default()
        }
    }

    /// Embedded/test backends without row-level security.
    pub fn development() -> Self {
        Self {
            rls_mode: RlsMode::ApplicationFilter,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: PolicyTable) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_default_restrictions(mut self, restrictions: Restrictions) -> Self {
        self.default_restrictions = restrictions;
        self
    }

    pub fn with_tenant_restrictions(
        mut self,
        tenant_id: impl Into<String>,
        restrictions: Restrictions,
    ) -> Self {
        self.tenant_restrictions.insert(tenant_id.into(), restrictions);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.rate_limit_window.is_zero() {
            return Err(CoreError::InvalidConfig {
                message: "rate_limit_window must be > 0".into(),
            });
        }
        if self.coalescer_warn_inflight == 0 {
            return Err(CoreError::InvalidConfig {
                message: "coalescer_warn_inflight must be > 0".into(),
            });
        }
        if self.policy.is_empty() {
            return Err(CoreError::InvalidConfig {
                message: "policy table has no rules".into(),
            });
        }
        Ok(())
    }
}
