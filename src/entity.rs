use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Closed set of entity types known to the platform.
///
/// Context entities (organizations, projects) own memberships and counters.
/// Product entities (tasks, attachments) are leaves owned by a context entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Organization,
    Project,
    Task,
    Attachment,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Organization,
        EntityType::Project,
        EntityType::Task,
        EntityType::Attachment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Organization => "organization",
            EntityType::Project => "project",
            EntityType::Task => "task",
            EntityType::Attachment => "attachment",
        }
    }

    pub fn is_context(self) -> bool {
        match self {
            EntityType::Organization | EntityType::Project => true,
            EntityType::Task | EntityType::Attachment => false,
        }
    }

    pub fn is_product(self) -> bool {
        !self.is_context()
    }

    /// Direct children in the context hierarchy.
    pub fn children(self) -> &'static [EntityType] {
        match self {
            EntityType::Organization => &[EntityType::Project, EntityType::Attachment],
            EntityType::Project => &[EntityType::Task],
            EntityType::Task | EntityType::Attachment => &[],
        }
    }

    /// All transitive descendants, breadth first.
    pub fn descendants(self) -> Vec<EntityType> {
        let mut out = Vec::new();
        let mut frontier: VecDeque<EntityType> = self.children().iter().copied().collect();
        while let Some(next) = frontier.pop_front() {
            if !out.contains(&next) {
                out.push(next);
                frontier.extend(next.children().iter().copied());
            }
        }
        out
    }

    /// Fields a client may edit. `fieldVersions` keys must come from this set.
    pub fn mutable_fields(self) -> &'static [&'static str] {
        match self {
            EntityType::Organization => &["name", "slug", "thumbnail_url", "banner_url"],
            EntityType::Project => &["name", "slug", "description", "thumbnail_url"],
            EntityType::Task => &[
                "summary",
                "description",
                "status",
                "impact",
                "assigned_to",
                "labels",
                "display_order",
            ],
            EntityType::Attachment => &["name", "filename", "content_type"],
        }
    }

    pub fn is_mutable_field(self, field: &str) -> bool {
        self.mutable_fields().contains(&field)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("unknown entity type '{s}'")))
    }
}

/// One hop in a context chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextRef {
    pub entity_type: EntityType,
    pub id: String,
}

pub type ContextChain = SmallVec<[ContextRef; 3]>;

/// A resolved, live entity with the ids of the contexts that own it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: String,
    pub tenant_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl EntityRef {
    pub fn organization(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            entity_type: EntityType::Organization,
            organization_id: id.clone(),
            id,
            tenant_id: tenant_id.into(),
            project_id: None,
        }
    }

    pub fn project(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            entity_type: EntityType::Project,
            project_id: Some(id.clone()),
            id,
            tenant_id: tenant_id.into(),
            organization_id: organization_id.into(),
        }
    }

    pub fn task(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: EntityType::Task,
            id: id.into(),
            tenant_id: tenant_id.into(),
            organization_id: organization_id.into(),
            project_id: Some(project_id.into()),
        }
    }

    pub fn attachment(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: EntityType::Attachment,
            id: id.into(),
            tenant_id: tenant_id.into(),
            organization_id: organization_id.into(),
            project_id: None,
        }
    }

    /// Context entities that may hold an applicable membership, nearest first.
    /// A context entity is the first hop of its own chain.
    pub fn context_chain(&self) -> ContextChain {
        let mut chain = ContextChain::new();
        match self.entity_type {
            EntityType::Organization => {}
            EntityType::Project => chain.push(ContextRef {
                entity_type: EntityType::Project,
                id: self.id.clone(),
            }),
            EntityType::Task | EntityType::Attachment => {
                if let Some(project_id) = &self.project_id {
                    chain.push(ContextRef {
                        entity_type: EntityType::Project,
                        id: project_id.clone(),
                    });
                }
            }
        }
        chain.push(ContextRef {
            entity_type: EntityType::Organization,
            id: self.organization_id.clone(),
        });
        chain
    }

    /// Whether this entity's ownership ids place it directly under `parent`.
    /// A project owns itself; anything else under an organization must not
    /// name a project, and anything under a project must name that project.
    pub fn is_linked_to(&self, parent: &EntityRef) -> bool {
        if self.tenant_id != parent.tenant_id || self.organization_id != parent.organization_id {
            return false;
        }
        match parent.entity_type {
            EntityType::Organization => {
                parent.id == self.organization_id
                    && match (self.entity_type, self.project_id.as_deref()) {
                        (EntityType::Project, project_id) => project_id == Some(self.id.as_str()),
                        (_, project_id) => project_id.is_none(),
                    }
            }
            EntityType::Project => {
                self.entity_type != EntityType::Project
                    && self.project_id.as_deref() == Some(parent.id.as_str())
            }
            EntityType::Task | EntityType::Attachment => false,
        }
    }

    /// Key of the context whose sequence counters track changes to this entity.
    pub fn owning_context_key(&self) -> ContextKey {
        match self.entity_type {
            EntityType::Organization | EntityType::Project => ContextKey::Entity(self.id.clone()),
            EntityType::Task | EntityType::Attachment => match &self.project_id {
                Some(project_id) => ContextKey::Entity(project_id.clone()),
                None => ContextKey::Entity(self.organization_id.clone()),
            },
        }
    }
}

/// Key of a context counter row: a context entity id, or the
/// `public:{entityType}` pseudo-key for tenant-less product entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    Entity(String),
    Public(EntityType),
}

const PUBLIC_PREFIX: &str = "public:";

impl ContextKey {
    pub fn entity(id: impl Into<String>) -> Self {
        ContextKey::Entity(id.into())
    }

    pub fn public(entity_type: EntityType) -> Self {
        ContextKey::Public(entity_type)
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.is_empty() {
            return Err(CoreError::Validation("context key must not be empty".into()));
        }
        match raw.strip_prefix(PUBLIC_PREFIX) {
            Some(entity_type) => {
                let entity_type = entity_type.parse::<EntityType>()?;
                if !entity_type.is_product() {
                    return Err(CoreError::Validation(format!(
                        "public context key requires a product entity type, got {entity_type}"
                    )));
                }
                Ok(ContextKey::Public(entity_type))
            }
            None => Ok(ContextKey::Entity(raw.to_string())),
        }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Entity(id) => f.write_str(id),
            ContextKey::Public(entity_type) => write!(f, "{PUBLIC_PREFIX}{entity_type}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn organization_descendants_cover_every_product_type() {
        assert_eq!(
            EntityType::Organization.descendants(),
            vec![EntityType::Project, EntityType::Attachment, EntityType::Task]
        );
        assert!(EntityType::Task.descendants().is_empty());
    }

    #[test]
    fn task_chain_walks_project_then_organization() {
        let task = EntityRef::task("t1", "tn", "o1", "p1");
        let chain = task.context_chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].entity_type, EntityType::Project);
        assert_eq!(chain[0].id, "p1");
        assert_eq!(chain[1].entity_type, EntityType::Organization);
        assert_eq!(chain[1].id, "o1");
    }

    #[test]
    fn linkage_follows_the_ownership_ids() {
        let org = EntityRef::organization("o1", "tn");
        let p1 = EntityRef::project("p1", "tn", "o1");
        assert!(p1.is_linked_to(&org));
        assert!(EntityRef::attachment("a1", "tn", "o1").is_linked_to(&org));
        assert!(EntityRef::task("t1", "tn", "o1", "p1").is_linked_to(&p1));

        assert!(!EntityRef::task("t1", "tn", "o1", "p2").is_linked_to(&p1));
        assert!(!EntityRef::task("t1", "tn", "o2", "p1").is_linked_to(&p1));
        assert!(!EntityRef::task("t1", "tn", "o1", "p1").is_linked_to(&org));
        assert!(!EntityRef::project("p1", "tn", "o2").is_linked_to(&org));
        let mut renamed = EntityRef::project("p3", "tn", "o1");
        renamed.project_id = Some("p1".into());
        assert!(!renamed.is_linked_to(&org));
        assert!(!EntityRef::project("p1", "other", "o1").is_linked_to(&org));
    }

    #[test]
    fn public_context_keys_round_trip_through_display() {
        let key = ContextKey::public(EntityType::Task);
        assert_eq!(key.to_string(), "public:task");
        assert_eq!(ContextKey::parse("public:task").expect("parse"), key);
        assert!(ContextKey::parse("public:organization").is_err());
        assert_eq!(
            ContextKey::parse("org_1").expect("parse"),
            ContextKey::entity("org_1")
        );
    }
}
