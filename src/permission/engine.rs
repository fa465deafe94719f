use super::{Action, Decision, Membership, PermissionContext, PermissionDecision, PolicyTable, Role};
use crate::entity::{ContextRef, EntityRef, EntityType};
use crate::error::CoreError;
use crate::storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// `{entityType: {action: allowed}}` for client-side UI gating.
pub type CapabilityMap = BTreeMap<EntityType, BTreeMap<Action, bool>>;

/// Resolves ids to live entities before a batch decision.
pub trait EntityResolver {
    fn resolve(&self, entity_type: EntityType, ids: &[String]) -> Result<Vec<EntityRef>, CoreError>;
}

impl<T: StorageBackend + ?Sized> EntityResolver for T {
    fn resolve(&self, entity_type: EntityType, ids: &[String]) -> Result<Vec<EntityRef>, CoreError> {
        self.resolve_entities(entity_type, ids)
    }
}

/// Disjoint partition of the requested ids. Together the two lists cover the
/// distinct input ids exactly once, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitResult {
    pub allowed_ids: Vec<String>,
    pub disallowed_ids: Vec<String>,
}

/// Active memberships indexed by the context they apply to.
struct MembershipIndex<'a> {
    by_context: HashMap<EntityType, HashMap<&'a str, Vec<&'a Membership>>>,
}

impl<'a> MembershipIndex<'a> {
    fn build(memberships: &'a [Membership]) -> Self {
        let mut by_context: HashMap<EntityType, HashMap<&'a str, Vec<&'a Membership>>> =
            HashMap::new();
        for m in memberships.iter().filter(|m| m.is_active()) {
            by_context
                .entry(m.context_type)
                .or_default()
                .entry(m.context_id.as_str())
                .or_default()
                .push(m);
        }
        Self { by_context }
    }

    fn at(&self, hop: &ContextRef, tenant_id: &str) -> Vec<&'a Membership> {
        self.by_context
            .get(&hop.entity_type)
            .and_then(|by_id| by_id.get(hop.id.as_str()))
            .map(|found| {
                found
                    .iter()
                    .copied()
                    .filter(|m| m.tenant_id == tenant_id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    policy: Arc<PolicyTable>,
}

impl PermissionEngine {
    pub fn new(policy: PolicyTable) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Walks the context chain nearest-first and grants on the first active
    /// membership whose role the policy allows.
    fn decide(
        &self,
        index: &MembershipIndex<'_>,
        target_type: EntityType,
        tenant_id: &str,
        chain: &[ContextRef],
        action: Action,
    ) -> bool {
        for hop in chain {
            for membership in index.at(hop, tenant_id) {
                match self.policy.lookup(membership.role, target_type, action) {
                    Some(true) => return true,
                    Some(false) => {}
                    None => {
                        if membership.role == Role::Admin
                            && hop.entity_type == EntityType::Organization
                            && target_type.is_product()
                        {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    fn allowed_on(&self, index: &MembershipIndex<'_>, action: Action, entity: &EntityRef) -> bool {
        self.decide(
            index,
            entity.entity_type,
            &entity.tenant_id,
            &entity.context_chain(),
            action,
        )
    }

    pub fn is_allowed(&self, ctx: &PermissionContext, action: Action, entity: &EntityRef) -> bool {
        if ctx.is_system_admin {
            return true;
        }
        let index = MembershipIndex::build(&ctx.memberships);
        self.allowed_on(&index, action, entity)
    }

    pub fn check_permission(
        &self,
        ctx: &PermissionContext,
        action: Action,
        entity: &EntityRef,
    ) -> PermissionDecision {
        PermissionDecision::Single(Decision {
            is_allowed: self.is_allowed(ctx, action, entity),
        })
    }

    /// One decision per entity id, never partial.
    pub fn check_permission_batch(
        &self,
        ctx: &PermissionContext,
        action: Action,
        entities: &[EntityRef],
    ) -> PermissionDecision {
        let index = MembershipIndex::build(&ctx.memberships);
        let results = entities
            .iter()
            .map(|entity| {
                let is_allowed = ctx.is_system_admin || self.allowed_on(&index, action, entity);
                (entity.id.clone(), Decision { is_allowed })
            })
            .collect();
        PermissionDecision::Batch { results }
    }

    /// Check on an existing entity. `Create` has no concrete entity yet and
    /// goes through [`Self::can_create`] or [`Self::can_access_collection`].
    pub fn can_access_entity(
        &self,
        ctx: &PermissionContext,
        action: Action,
        entity: &EntityRef,
    ) -> Result<(), CoreError> {
        if action == Action::Create {
            return Err(CoreError::Validation(
                "create checks need a parent context, use can_create".into(),
            ));
        }
        if self.is_allowed(ctx, action, entity) {
            return Ok(());
        }
        debug!(
            user_id = %ctx.user_id,
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            %action,
            "permission denied"
        );
        Err(CoreError::forbidden(
            entity.entity_type,
            entity.id.clone(),
            action.as_str(),
        ))
    }

    /// Whether `ctx` may create an `entity_type` under `parent`.
    pub fn can_create(
        &self,
        ctx: &PermissionContext,
        entity_type: EntityType,
        parent: &EntityRef,
    ) -> Result<(), CoreError> {
        self.can_access_collection(ctx, Action::Create, entity_type, parent)
    }

    /// Collection-level check with no concrete entity, such as "may read
    /// tasks in p1". Decided against `context`'s chain, so `entity_type` must
    /// live below `context`.
    pub fn can_access_collection(
        &self,
        ctx: &PermissionContext,
        action: Action,
        entity_type: EntityType,
        context: &EntityRef,
    ) -> Result<(), CoreError> {
        if !context.entity_type.descendants().contains(&entity_type) {
            return Err(CoreError::Validation(format!(
                "{entity_type} does not live under {}",
                context.entity_type
            )));
        }
        if ctx.is_system_admin {
            return Ok(());
        }
        let index = MembershipIndex::build(&ctx.memberships);
        if self.decide(
            &index,
            entity_type,
            &context.tenant_id,
            &context.context_chain(),
            action,
        ) {
            return Ok(());
        }
        debug!(
            user_id = %ctx.user_id,
            %entity_type,
            context_id = %context.id,
            %action,
            "collection access denied"
        );
        Err(CoreError::forbidden(
            context.entity_type,
            context.id.clone(),
            format!("{action} {entity_type}"),
        ))
    }

    /// Resolves `ids`, batch-checks them and partitions the result. Never
    /// fails: ids that do not resolve, and every id when resolution itself
    /// fails, land in `disallowed_ids`.
    pub fn split_by_permission<R: EntityResolver + ?Sized>(
        &self,
        ctx: &PermissionContext,
        action: Action,
        entity_type: EntityType,
        ids: &[String],
        resolver: &R,
    ) -> SplitResult {
        let mut seen = HashSet::with_capacity(ids.len());
        let distinct: Vec<String> = ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect();

        let entities = match resolver.resolve(entity_type, &distinct) {
            Ok(entities) => entities,
            Err(err) => {
                warn!(%entity_type, error = %err, "entity resolution failed, denying batch");
                return SplitResult {
                    allowed_ids: Vec::new(),
                    disallowed_ids: distinct,
                };
            }
        };
        let live: Vec<EntityRef> = entities
            .into_iter()
            .filter(|e| e.entity_type == entity_type)
            .collect();
        let decision = self.check_permission_batch(ctx, action, &live);

        let mut split = SplitResult::default();
        for id in distinct {
            if decision.allowed_for(&id) == Some(true) {
                split.allowed_ids.push(id);
            } else {
                split.disallowed_ids.push(id);
            }
        }
        split
    }

    /// Capabilities on `entity` and every descendant entity type beneath it.
    pub fn capabilities(&self, ctx: &PermissionContext, entity: &EntityRef) -> CapabilityMap {
        let index = MembershipIndex::build(&ctx.memberships);
        let chain = entity.context_chain();
        std::iter::once(entity.entity_type)
            .chain(entity.entity_type.descendants())
            .map(|target| {
                let actions = Action::ALL
                    .into_iter()
                    .map(|action| {
                        let allowed = ctx.is_system_admin
                            || self.decide(&index, target, &entity.tenant_id, &chain, action);
                        (action, allowed)
                    })
                    .collect();
                (target, actions)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PermissionEngine {
        PermissionEngine::new(PolicyTable::product_default())
    }

    #[test]
    fn project_member_reaches_tasks_but_not_sibling_projects() {
        let ctx = PermissionContext::new(
            "u1",
            vec![Membership::project("u1", "tn", "o1", "p1", Role::Member)],
        );
        let own = EntityRef::task("t1", "tn", "o1", "p1");
        let other = EntityRef::task("t2", "tn", "o1", "p2");
        assert!(engine().is_allowed(&ctx, Action::Update, &own));
        assert!(!engine().is_allowed(&ctx, Action::Read, &other));
    }

    #[test]
    fn pending_memberships_grant_nothing() {
        let ctx = PermissionContext::new(
            "u1",
            vec![Membership::organization("u1", "tn", "o1", Role::Admin).into_pending()],
        );
        let org = EntityRef::organization("o1", "tn");
        assert!(!engine().is_allowed(&ctx, Action::Read, &org));
    }

    #[test]
    fn membership_in_another_tenant_does_not_apply() {
        let ctx = PermissionContext::new(
            "u1",
            vec![Membership::organization("u1", "tenant_b", "o1", Role::Admin)],
        );
        let org = EntityRef::organization("o1", "tenant_a");
        assert!(!engine().is_allowed(&ctx, Action::Read, &org));
    }

    #[test]
    fn org_admin_implicitly_reaches_products_unless_narrowed() {
        let policy = PolicyTable::new()
            .allow(Role::Admin, EntityType::Organization, &[Action::Read])
            .deny(Role::Admin, EntityType::Attachment, &[Action::Delete]);
        let engine = PermissionEngine::new(policy);
        let ctx = PermissionContext::new(
            "u1",
            vec![Membership::organization("u1", "tn", "o1", Role::Admin)],
        );
        let task = EntityRef::task("t1", "tn", "o1", "p1");
        let attachment = EntityRef::attachment("a1", "tn", "o1");
        let project = EntityRef::project("p1", "tn", "o1");
        assert!(engine.is_allowed(&ctx, Action::Delete, &task));
        assert!(engine.is_allowed(&ctx, Action::Read, &attachment));
        assert!(!engine.is_allowed(&ctx, Action::Delete, &attachment));
        // Projects are context entities: no implicit grant.
        assert!(!engine.is_allowed(&ctx, Action::Update, &project));
    }

    #[test]
    fn can_access_entity_rejects_create_and_denies_with_forbidden() {
        let ctx = PermissionContext::new("u1", Vec::new());
        let task = EntityRef::task("t1", "tn", "o1", "p1");
        let err = engine()
            .can_access_entity(&ctx, Action::Create, &task)
            .expect_err("create");
        assert_eq!(err.code_str(), "validation");
        let err = engine()
            .can_access_entity(&ctx, Action::Read, &task)
            .expect_err("denied");
        assert_eq!(err.code_str(), "forbidden");
        assert_eq!(err.public_code().as_str(), "not_found");
    }

    #[test]
    fn can_create_follows_parent_chain() {
        let ctx = PermissionContext::new(
            "u1",
            vec![Membership::project("u1", "tn", "o1", "p1", Role::Guest)],
        );
        let project = EntityRef::project("p1", "tn", "o1");
        assert!(engine().can_create(&ctx, EntityType::Task, &project).is_err());
        let member = PermissionContext::new(
            "u2",
            vec![Membership::project("u2", "tn", "o1", "p1", Role::Member)],
        );
        engine()
            .can_create(&member, EntityType::Task, &project)
            .expect("member creates tasks");
        let org = EntityRef::organization("o1", "tn");
        assert!(engine().can_create(&member, EntityType::Organization, &org).is_err());
    }

    #[test]
    fn collection_checks_use_the_context_chain() {
        let guest = PermissionContext::new(
            "u1",
            vec![Membership::project("u1", "tn", "o1", "p1", Role::Guest)],
        );
        let p1 = EntityRef::project("p1", "tn", "o1");
        let p2 = EntityRef::project("p2", "tn", "o1");
        engine()
            .can_access_collection(&guest, Action::Read, EntityType::Task, &p1)
            .expect("may read tasks in p1");
        let err = engine()
            .can_access_collection(&guest, Action::Read, EntityType::Task, &p2)
            .expect_err("no membership in p2");
        assert_eq!(err.code_str(), "forbidden");
        assert!(engine()
            .can_access_collection(&guest, Action::Create, EntityType::Task, &p1)
            .is_err());
        let err = engine()
            .can_access_collection(&guest, Action::Read, EntityType::Project, &p1)
            .expect_err("projects do not live under projects");
        assert_eq!(err.code_str(), "validation");
        engine()
            .can_access_collection(
                &PermissionContext::system_admin("root"),
                Action::Delete,
                EntityType::Task,
                &p2,
            )
            .expect("system admin");
    }

    #[test]
    fn capability_map_covers_self_and_descendants() {
        let ctx = PermissionContext::new(
            "u1",
            vec![Membership::organization("u1", "tn", "o1", Role::Member)],
        );
        let org = EntityRef::organization("o1", "tn");
        let caps = engine().capabilities(&ctx, &org);
        assert_eq!(
            caps.keys().copied().collect::<Vec<_>>(),
            vec![
                EntityType::Organization,
                EntityType::Project,
                EntityType::Task,
                EntityType::Attachment
            ]
        );
        assert!(caps[&EntityType::Organization][&Action::Read]);
        assert!(!caps[&EntityType::Organization][&Action::Update]);
        assert!(caps[&EntityType::Task][&Action::Create]);
        assert!(!caps[&EntityType::Attachment][&Action::Delete]);
    }
}
