use super::{
    ContextCounter, Counter, RlsSession, RowUpdate, SeqKind, StorageBackend, StorageCapabilities,
    StoredRow, Visibility, now_micros,
};
use crate::entity::{ContextKey, EntityRef, EntityType};
use crate::error::CoreError;
use im::{HashMap as ImHashMap, OrdMap};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

type CounterKey = (String, String, String);

#[derive(Debug, Clone, Default)]
struct MemoryState {
    counters: ImHashMap<CounterKey, Counter>,
    context_counters: OrdMap<String, ContextCounter>,
    rows: OrdMap<(EntityType, String), StoredRow>,
}

/// In-process backend. Every statement runs under one write lock, which gives
/// the same atomicity as a single-statement upsert on a relational engine.
/// Reads clone the persistent maps and iterate outside the lock.
#[derive(Debug)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    capabilities: StorageCapabilities,
    available: AtomicBool,
    sessions: Mutex<HashMap<u64, Visibility>>,
    next_session: AtomicU64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Backend without native row-level security, like most embedded engines.
    pub fn new() -> Self {
        Self::with_capabilities(StorageCapabilities::default())
    }

    pub fn with_row_level_security() -> Self {
        Self::with_capabilities(StorageCapabilities {
            row_level_security: true,
        })
    }

    fn with_capabilities(capabilities: StorageCapabilities) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            capabilities,
            available: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Failure injection: while unavailable every statement fails with
    /// `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn open_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn ensure_available(&self) -> Result<(), CoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::unavailable("memory backend marked unavailable"))
        }
    }

    fn session_visibility(
        &self,
        session: Option<RlsSession>,
    ) -> Result<Option<Visibility>, CoreError> {
        let Some(session) = session else {
            return Ok(None);
        };
        if !self.capabilities.row_level_security {
            return Err(CoreError::Validation(
                "backend does not support row-level security sessions".into(),
            ));
        }
        self.sessions
            .lock()
            .get(&session.0)
            .cloned()
            .map(Some)
            .ok_or_else(|| CoreError::Unauthorized(format!("unknown rls session {}", session.0)))
    }

    fn context_counter_mut<'a>(
        state: &'a mut MemoryState,
        context_key: &ContextKey,
    ) -> &'a mut ContextCounter {
        state
            .context_counters
            .entry(context_key.to_string())
            .or_insert_with(|| ContextCounter::new(context_key, BTreeMap::new()))
    }
}

impl StorageBackend for MemoryStorage {
    fn capabilities(&self) -> StorageCapabilities {
        self.capabilities
    }

    fn increment_counter(
        &self,
        namespace: &str,
        scope: &str,
        key: &str,
        delta: i64,
    ) -> Result<Counter, CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let counter_key = (namespace.to_string(), scope.to_string(), key.to_string());
        let current = state.counters.get(&counter_key).map(|c| c.value).unwrap_or(0);
        let value = current.checked_add(delta).ok_or_else(|| {
            CoreError::Validation(format!(
                "counter {namespace}/{scope}/{key} overflows on delta {delta}"
            ))
        })?;
        let counter = Counter {
            namespace: namespace.to_string(),
            scope: scope.to_string(),
            key: key.to_string(),
            value,
            updated_at: now_micros(),
        };
        state.counters.insert(counter_key, counter.clone());
        Ok(counter)
    }

    fn read_counter(
        &self,
        namespace: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<Counter>, CoreError> {
        self.ensure_available()?;
        let counter_key = (namespace.to_string(), scope.to_string(), key.to_string());
        Ok(self.state.read().counters.get(&counter_key).cloned())
    }

    fn seed_context_counts(
        &self,
        context_key: &ContextKey,
        counts: &BTreeMap<String, i64>,
    ) -> Result<usize, CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let row = Self::context_counter_mut(&mut state, context_key);
        let mut added = 0;
        for (key, value) in counts {
            if !row.counts.contains_key(key) {
                row.counts.insert(key.clone(), *value);
                added += 1;
            }
        }
        if added > 0 {
            row.updated_at = now_micros();
        }
        Ok(added)
    }

    fn bump_context_seq(
        &self,
        context_key: &ContextKey,
        kind: SeqKind,
    ) -> Result<ContextCounter, CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let row = Self::context_counter_mut(&mut state, context_key);
        match kind {
            SeqKind::Entity => row.seq += 1,
            SeqKind::Membership => row.m_seq += 1,
        }
        row.updated_at = now_micros();
        Ok(row.clone())
    }

    fn adjust_context_counts(
        &self,
        context_key: &ContextKey,
        deltas: &BTreeMap<String, i64>,
    ) -> Result<ContextCounter, CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let row = Self::context_counter_mut(&mut state, context_key);
        for (key, delta) in deltas {
            let slot = row.counts.entry(key.clone()).or_insert(0);
            *slot = slot.saturating_add(*delta);
        }
        row.updated_at = now_micros();
        Ok(row.clone())
    }

    fn read_context_counter(
        &self,
        context_key: &ContextKey,
    ) -> Result<Option<ContextCounter>, CoreError> {
        self.ensure_available()?;
        Ok(self
            .state
            .read()
            .context_counters
            .get(&context_key.to_string())
            .cloned())
    }

    fn insert_row(&self, row: StoredRow) -> Result<(), CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let key = (row.entity.entity_type, row.entity.id.clone());
        if state.rows.contains_key(&key) {
            return Err(CoreError::Conflict(format!(
                "{} '{}' already exists",
                row.entity.entity_type, row.entity.id
            )));
        }
        state.rows.insert(key, row);
        Ok(())
    }

    fn update_row(
        &self,
        entity_type: EntityType,
        id: &str,
        update: &mut RowUpdate<'_>,
    ) -> Result<StoredRow, CoreError> {
        self.ensure_available()?;
        let mut state = self.state.write();
        let key = (entity_type, id.to_string());
        let Some(current) = state.rows.get(&key) else {
            return Err(CoreError::not_found(entity_type, id));
        };
        let next = update(current)?;
        if next.entity.id != id || next.entity.entity_type != entity_type {
            warn!(%entity_type, id, "row update attempted to change the row identity");
            return Err(CoreError::Internal("row update changed row identity".into()));
        }
        state.rows.insert(key, next.clone());
        Ok(next)
    }

    fn fetch_row(
        &self,
        entity_type: EntityType,
        id: &str,
        session: Option<RlsSession>,
    ) -> Result<Option<StoredRow>, CoreError> {
        self.ensure_available()?;
        let visibility = self.session_visibility(session)?;
        let row = self
            .state
            .read()
            .rows
            .get(&(entity_type, id.to_string()))
            .cloned();
        Ok(row.filter(|r| visibility.as_ref().is_none_or(|v| v.permits(r.tenant_id()))))
    }

    fn scan_rows(
        &self,
        entity_type: EntityType,
        session: Option<RlsSession>,
    ) -> Result<Vec<StoredRow>, CoreError> {
        self.ensure_available()?;
        let visibility = self.session_visibility(session)?;
        let rows = self.state.read().rows.clone();
        Ok(rows
            .values()
            .filter(|r| r.entity.entity_type == entity_type)
            .filter(|r| visibility.as_ref().is_none_or(|v| v.permits(r.tenant_id())))
            .cloned()
            .collect())
    }

    fn resolve_entities(
        &self,
        entity_type: EntityType,
        ids: &[String],
    ) -> Result<Vec<EntityRef>, CoreError> {
        self.ensure_available()?;
        let rows = self.state.read().rows.clone();
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(&(entity_type, id.clone())))
            .map(|row| row.entity.clone())
            .collect())
    }

    fn open_rls_session(&self, visibility: &Visibility) -> Result<RlsSession, CoreError> {
        self.ensure_available()?;
        if !self.capabilities.row_level_security {
            return Err(CoreError::Validation(
                "backend does not support row-level security sessions".into(),
            ));
        }
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(id, visibility.clone());
        Ok(RlsSession(id))
    }

    fn close_rls_session(&self, session: RlsSession) {
        self.sessions.lock().remove(&session.0);
    }
}
