//! Storage contract consumed by the core.
//!
//! Row shapes here are the wire contract with the storage engine. A backend
//! must provide statement-level atomic increment-upsert, insert-if-absent and
//! a transactional read-modify-write for rows. Native row-level security is
//! optional and advertised through [`StorageCapabilities`].

pub mod memory;

use crate::entity::{ContextKey, EntityRef, EntityType};
use crate::error::CoreError;
use crate::mutation::tx::MutationMetadata;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub use memory::MemoryStorage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub namespace: String,
    pub scope: String,
    pub key: String,
    pub value: i64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCounter {
    pub context_key: String,
    pub seq: u64,
    pub m_seq: u64,
    #[serde(default)]
    pub counts: BTreeMap<String, i64>,
    pub updated_at: u64,
}

impl ContextCounter {
    pub fn new(context_key: &ContextKey, counts: BTreeMap<String, i64>) -> Self {
        Self {
            context_key: context_key.to_string(),
            seq: 0,
            m_seq: 0,
            counts,
            updated_at: now_micros(),
        }
    }

    pub fn count(&self, key: &str) -> i64 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

/// Which of the two context sequences a change advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SeqKind {
    /// Product-entity changes (`seq`).
    Entity,
    /// Membership changes (`mSeq`).
    Membership,
}

/// A tenant-scoped mutable row with its mutation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRow {
    pub entity: EntityRef,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub tx: MutationMetadata,
    pub updated_at: u64,
}

impl StoredRow {
    pub fn tenant_id(&self) -> &str {
        &self.entity.tenant_id
    }
}

/// Rows an identity may see.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Visibility {
    pub user_id: String,
    pub tenant_ids: BTreeSet<String>,
    pub unrestricted: bool,
}

impl Visibility {
    pub fn permits(&self, tenant_id: &str) -> bool {
        self.unrestricted || self.tenant_ids.contains(tenant_id)
    }
}

/// Handle of a native row-level-security session opened on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RlsSession(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageCapabilities {
    pub row_level_security: bool,
}

/// Transactional mutation applied to the current version of a row.
pub type RowUpdate<'a> = dyn FnMut(&StoredRow) -> Result<StoredRow, CoreError> + 'a;

pub trait StorageBackend: Send + Sync {
    fn capabilities(&self) -> StorageCapabilities;

    /// Atomic increment-upsert of `(namespace, scope, key)`. Creates the row at
    /// `delta` when absent.
    fn increment_counter(
        &self,
        namespace: &str,
        scope: &str,
        key: &str,
        delta: i64,
    ) -> Result<Counter, CoreError>;

    fn read_counter(
        &self,
        namespace: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<Counter>, CoreError>;

    /// Insert-if-absent per count key, creating a zeroed row when absent.
    /// `seq`, `mSeq` and keys already present are left untouched. Returns how
    /// many keys were added.
    fn seed_context_counts(
        &self,
        context_key: &ContextKey,
        counts: &BTreeMap<String, i64>,
    ) -> Result<usize, CoreError>;

    /// Atomic increment of `seq` or `mSeq`, creating a zeroed row when absent.
    fn bump_context_seq(
        &self,
        context_key: &ContextKey,
        kind: SeqKind,
    ) -> Result<ContextCounter, CoreError>;

    /// Atomic add of each delta into `counts`.
    fn adjust_context_counts(
        &self,
        context_key: &ContextKey,
        deltas: &BTreeMap<String, i64>,
    ) -> Result<ContextCounter, CoreError>;

    fn read_context_counter(
        &self,
        context_key: &ContextKey,
    ) -> Result<Option<ContextCounter>, CoreError>;

    /// Inserts a new row. Fails with `Conflict` when the id already exists.
    fn insert_row(&self, row: StoredRow) -> Result<(), CoreError>;

    /// Runs `update` against the current row and stores its result within a
    /// single transaction. `NotFound` when the row does not exist.
    fn update_row(
        &self,
        entity_type: EntityType,
        id: &str,
        update: &mut RowUpdate<'_>,
    ) -> Result<StoredRow, CoreError>;

    /// Reads one row. When `session` is given the backend applies its own
    /// row-level security for that session.
    fn fetch_row(
        &self,
        entity_type: EntityType,
        id: &str,
        session: Option<RlsSession>,
    ) -> Result<Option<StoredRow>, CoreError>;

    fn scan_rows(
        &self,
        entity_type: EntityType,
        session: Option<RlsSession>,
    ) -> Result<Vec<StoredRow>, CoreError>;

    /// Resolves ids to live entities; unknown ids are omitted.
    fn resolve_entities(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<EntityRef>, CoreError>;

    /// Only called when `capabilities().row_level_security` is set.
    fn open_rls_session(&self, visibility: &Visibility) -> Result<RlsSession, CoreError>;

    fn close_rls_session(&self, session: RlsSession);
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
