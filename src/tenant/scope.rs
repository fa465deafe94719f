use super::Identity;
use crate::config::RlsMode;
use crate::entity::{EntityRef, EntityType};
use crate::error::{CoreError, ResourceType};
use crate::storage::{RlsSession, StorageBackend, StoredRow, Visibility};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

tokio::task_local! {
    static ACTIVE_SCOPE: String;
}

/// How a scope constrains reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationStrategy {
    /// The backend filters rows for an opened row-level-security session.
    Native,
    /// The backend returns everything and the scope filters by tenant.
    ApplicationFilter,
}

/// Establishes identity-bound execution contexts.
///
/// The isolation strategy is fixed at construction from the configured
/// [`RlsMode`] and the backend's advertised capabilities.
pub struct TenantContextSwitcher {
    storage: Arc<dyn StorageBackend>,
    strategy: IsolationStrategy,
    active: Arc<AtomicUsize>,
}

impl TenantContextSwitcher {
    pub fn new(storage: Arc<dyn StorageBackend>, mode: RlsMode) -> Result<Self, CoreError> {
        let native = storage.capabilities().row_level_security;
        let strategy = match (mode, native) {
            (RlsMode::Native, false) => {
                return Err(CoreError::InvalidConfig {
                    message: "rls_mode=native but the storage backend has no row-level security"
                        .into(),
                });
            }
            (RlsMode::Native, true) | (RlsMode::Auto, true) => IsolationStrategy::Native,
            (RlsMode::Auto, false) | (RlsMode::ApplicationFilter, _) => {
                IsolationStrategy::ApplicationFilter
            }
        };
        info!(?strategy, "tenant isolation strategy selected");
        Ok(Self {
            storage,
            strategy,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }

    /// Scopes currently held open.
    pub fn active_scopes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs `f` inside a scope bound to `identity`.
    ///
    /// The context is held for exactly the duration of this call and released
    /// once on every exit path: success, error, early return, panic or
    /// cancellation of the returned future. The [`TenantScope`] handed to `f`
    /// does not own the context; copies that outlive the call refuse every
    /// read. Opening a scope while one is already active on the same task is
    /// rejected.
    pub async fn set_user_rls_context<F, Fut, T>(
        &self,
        identity: &Identity,
        f: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce(TenantScope) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        if ACTIVE_SCOPE.try_with(|_| ()).is_ok() {
            warn!(user_id = %identity.user_id, "nested tenant scope rejected");
            return Err(CoreError::NestedScope);
        }
        let lease = self.enter(identity)?;
        let scope = TenantScope {
            state: Arc::clone(&lease.state),
        };
        let result = ACTIVE_SCOPE
            .scope(identity.user_id.clone(), async move { f(scope).await })
            .await;
        drop(lease);
        result
    }

    fn enter(&self, identity: &Identity) -> Result<ScopeLease, CoreError> {
        let visibility = identity.visibility();
        let session = match self.strategy {
            IsolationStrategy::Native => Some(self.storage.open_rls_session(&visibility)?),
            IsolationStrategy::ApplicationFilter => None,
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(user_id = %identity.user_id, strategy = ?self.strategy, "tenant scope entered");
        Ok(ScopeLease {
            state: Arc::new(ScopeState {
                storage: Arc::clone(&self.storage),
                identity: identity.clone(),
                visibility,
                session,
                released: AtomicBool::new(false),
            }),
            active: Arc::clone(&self.active),
        })
    }
}

struct ScopeState {
    storage: Arc<dyn StorageBackend>,
    identity: Identity,
    visibility: Visibility,
    session: Option<RlsSession>,
    released: AtomicBool,
}

/// Owns the open context for one `set_user_rls_context` call.
struct ScopeLease {
    state: Arc<ScopeState>,
    active: Arc<AtomicUsize>,
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        if self.state.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.state.session {
            self.state.storage.close_rls_session(session);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(user_id = %self.state.identity.user_id, "tenant scope released");
    }
}

/// Identity-bound view of storage, valid while its `set_user_rls_context`
/// call runs. Once that call returns every read fails with `Unauthorized`
/// and `permits` answers `false`.
#[derive(Clone)]
pub struct TenantScope {
    state: Arc<ScopeState>,
}

impl TenantScope {
    pub fn identity(&self) -> &Identity {
        &self.state.identity
    }

    pub fn visibility(&self) -> &Visibility {
        &self.state.visibility
    }

    pub fn strategy(&self) -> IsolationStrategy {
        if self.state.session.is_some() {
            IsolationStrategy::Native
        } else {
            IsolationStrategy::ApplicationFilter
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::SeqCst)
    }

    pub fn permits(&self, tenant_id: &str) -> bool {
        !self.is_released() && self.state.visibility.permits(tenant_id)
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_released() {
            return Err(CoreError::Unauthorized(format!(
                "tenant scope for '{}' was released",
                self.state.identity.user_id
            )));
        }
        Ok(())
    }

    /// Fails with `Forbidden` when `entity` lies outside the scope.
    pub fn ensure_visible(&self, entity: &EntityRef) -> Result<(), CoreError> {
        self.ensure_open()?;
        if self.permits(&entity.tenant_id) {
            return Ok(());
        }
        Err(CoreError::forbidden(
            ResourceType::Tenant,
            entity.tenant_id.clone(),
            format!("access {} '{}'", entity.entity_type, entity.id),
        ))
    }

    /// Drops rows outside the scope. Applied to rows obtained outside the
    /// scope's own reads, such as coalesced fetches.
    pub fn filter_visible(&self, row: Option<StoredRow>) -> Option<StoredRow> {
        row.filter(|r| self.permits(r.tenant_id()))
    }

    pub fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Option<StoredRow>, CoreError> {
        self.ensure_open()?;
        let session = self.state.session;
        let row = self.state.storage.fetch_row(entity_type, id, session)?;
        Ok(match session {
            Some(_) => row,
            None => self.filter_visible(row),
        })
    }

    pub fn scan(&self, entity_type: EntityType) -> Result<Vec<StoredRow>, CoreError> {
        self.ensure_open()?;
        let session = self.state.session;
        let rows = self.state.storage.scan_rows(entity_type, session)?;
        Ok(match session {
            Some(_) => rows,
            None => rows
                .into_iter()
                .filter(|r| self.permits(r.tenant_id()))
                .collect(),
        })
    }
}
