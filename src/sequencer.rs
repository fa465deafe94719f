use crate::entity::{ContextKey, EntityType};
use crate::error::CoreError;
use crate::permission::Role;
use crate::storage::{ContextCounter, SeqKind, StorageBackend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const COUNT_MEMBERS_TOTAL: &str = "m:total";
pub const COUNT_MEMBERS_PENDING: &str = "m:pending";

pub fn role_count_key(role: Role) -> String {
    format!("m:{role}")
}

pub fn child_count_key(entity_type: EntityType) -> String {
    format!("e:{entity_type}")
}

/// Whether a client must refetch before trusting the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUp {
    pub current_seq: u64,
    pub last_seen_seq: u64,
    pub missed: u64,
}

impl CatchUp {
    pub fn evaluate(current_seq: u64, last_seen_seq: u64) -> Self {
        Self {
            current_seq,
            last_seen_seq,
            missed: current_seq.saturating_sub(last_seen_seq),
        }
    }

    pub fn is_behind(&self) -> bool {
        self.missed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityChange {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum MembershipChange {
    Invited { role: Role },
    Activated { role: Role },
    RoleChanged { from: Role, to: Role },
    Removed { role: Role },
}

/// A committed change observed by the change-feed consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Entity {
        context: ContextKey,
        entity_type: EntityType,
        change: EntityChange,
    },
    Membership {
        context: ContextKey,
        change: MembershipChange,
    },
}

/// Owns `seq`/`mSeq` advancement and the denormalized `counts` map.
///
/// `bump_context_seq` and `apply_change` must be driven by exactly one logical
/// writer, the change-feed consumer, once per committed change. The storage
/// layer does not enforce this: a second writer would double-count.
#[derive(Clone)]
pub struct ContextSequencer {
    storage: Arc<dyn StorageBackend>,
}

impl ContextSequencer {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Seeds counters for newly created context entities. Insert-if-absent
    /// per count key: a row created early by a sequence bump still gets its
    /// counts, while keys already present keep their values. Returns how many
    /// rows received at least one new key.
    pub fn init_context_counters(
        &self,
        entity_type: EntityType,
        entity_ids: &[String],
        creator_role: Role,
    ) -> Result<usize, CoreError> {
        if !entity_type.is_context() {
            return Err(CoreError::Validation(format!(
                "{entity_type} is not a context entity type"
            )));
        }
        let counts = initial_counts(entity_type, creator_role);
        let mut seeded = 0;
        for id in entity_ids {
            let key = ContextKey::entity(id.clone());
            if self.storage.seed_context_counts(&key, &counts)? > 0 {
                seeded += 1;
            }
        }
        debug!(%entity_type, requested = entity_ids.len(), seeded, "context counters seeded");
        Ok(seeded)
    }

    /// Advances `seq` or `mSeq` by exactly one and returns the new value.
    pub fn bump_context_seq(&self, context_key: &ContextKey, kind: SeqKind) -> Result<u64, CoreError> {
        let row = self
            .storage
            .bump_context_seq(context_key, kind)
            .inspect_err(|err| {
                warn!(context_key = %context_key, ?kind, error = %err, "sequence bump failed");
            })?;
        let value = match kind {
            SeqKind::Entity => row.seq,
            SeqKind::Membership => row.m_seq,
        };
        debug!(context_key = %context_key, ?kind, value, "sequence advanced");
        Ok(value)
    }

    /// Best-effort count adjustment. Counts never feed security decisions.
    pub fn adjust_counts(
        &self,
        context_key: &ContextKey,
        deltas: &BTreeMap<String, i64>,
    ) -> Result<ContextCounter, CoreError> {
        self.storage.adjust_context_counts(context_key, deltas)
    }

    pub fn get(&self, context_key: &ContextKey) -> Result<Option<ContextCounter>, CoreError> {
        self.storage.read_context_counter(context_key)
    }

    pub fn catch_up(&self, context_key: &ContextKey, last_seen_seq: u64) -> Result<CatchUp, CoreError> {
        let current = self.get(context_key)?.map(|row| row.seq).unwrap_or(0);
        Ok(CatchUp::evaluate(current, last_seen_seq))
    }

    /// Applies one observed change: a single sequence bump plus the matching
    /// count deltas.
    pub fn apply_change(&self, event: &ChangeEvent) -> Result<u64, CoreError> {
        let (context, kind, deltas) = match event {
            ChangeEvent::Entity {
                context,
                entity_type,
                change,
            } => {
                let delta = match change {
                    EntityChange::Created => 1,
                    EntityChange::Updated => 0,
                    EntityChange::Deleted => -1,
                };
                let mut deltas = BTreeMap::new();
                if delta != 0 {
                    deltas.insert(child_count_key(*entity_type), delta);
                }
                (context, SeqKind::Entity, deltas)
            }
            ChangeEvent::Membership { context, change } => {
                (context, SeqKind::Membership, membership_deltas(*change))
            }
        };
        let value = self.bump_context_seq(context, kind)?;
        if !deltas.is_empty() {
            self.adjust_counts(context, &deltas)?;
        }
        Ok(value)
    }
}

fn initial_counts(entity_type: EntityType, creator_role: Role) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for role in Role::ALL {
        counts.insert(role_count_key(role), 0);
    }
    counts.insert(role_count_key(creator_role), 1);
    counts.insert(COUNT_MEMBERS_PENDING.to_string(), 0);
    counts.insert(COUNT_MEMBERS_TOTAL.to_string(), 1);
    for child in entity_type.children() {
        counts.insert(child_count_key(*child), 0);
    }
    counts
}

fn membership_deltas(change: MembershipChange) -> BTreeMap<String, i64> {
    let mut deltas = BTreeMap::new();
    match change {
        MembershipChange::Invited { .. } => {
            deltas.insert(COUNT_MEMBERS_PENDING.to_string(), 1);
        }
        MembershipChange::Activated { role } => {
            deltas.insert(COUNT_MEMBERS_PENDING.to_string(), -1);
            deltas.insert(role_count_key(role), 1);
            deltas.insert(COUNT_MEMBERS_TOTAL.to_string(), 1);
        }
        MembershipChange::RoleChanged { from, to } => {
            if from != to {
                deltas.insert(role_count_key(from), -1);
                deltas.insert(role_count_key(to), 1);
            }
        }
        MembershipChange::Removed { role } => {
            deltas.insert(role_count_key(role), -1);
            deltas.insert(COUNT_MEMBERS_TOTAL.to_string(), -1);
        }
    }
    deltas
}
