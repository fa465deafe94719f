use crate::counter::CounterStore;
use crate::entity::EntityType;
use crate::error::CoreError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const USAGE_NAMESPACE: &str = "usage";
pub const RATE_NAMESPACE: &str = "rate";

/// Configured limits are `u64`; counters are `i64`. Limits past `i64::MAX`
/// can never be reached.
fn limit_ceiling(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Per-tenant limits. `0` means unlimited for quotas and rate limits alike.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restrictions {
    #[serde(default)]
    pub quotas: BTreeMap<EntityType, u64>,
    #[serde(default)]
    pub rate_limits: RateLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimits {
    pub api_points_per_hour: u64,
}

impl Restrictions {
    pub fn with_quota(mut self, entity_type: EntityType, limit: u64) -> Self {
        self.quotas.insert(entity_type, limit);
        self
    }

    pub fn with_api_points_per_hour(mut self, points: u64) -> Self {
        self.rate_limits.api_points_per_hour = points;
        self
    }

    pub fn quota(&self, entity_type: EntityType) -> u64 {
        self.quotas.get(&entity_type).copied().unwrap_or(0)
    }
}

/// Default restrictions plus per-tenant overrides.
#[derive(Debug, Default)]
pub struct RestrictionsRegistry {
    default: Restrictions,
    overrides: RwLock<HashMap<String, Restrictions>>,
}

impl RestrictionsRegistry {
    pub fn new(default: Restrictions) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, tenant_id: impl Into<String>, restrictions: Restrictions) {
        self.overrides.write().insert(tenant_id.into(), restrictions);
    }

    pub fn for_tenant(&self, tenant_id: &str) -> Restrictions {
        self.overrides
            .read()
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Enforces `Restrictions.quotas` before an insert.
///
/// Reservation increments the usage counter first and rolls the increment
/// back when the limit is exceeded, so two racing creators can never both
/// take the last slot.
#[derive(Clone)]
pub struct QuotaGuard {
    counters: CounterStore,
    registry: Arc<RestrictionsRegistry>,
}

impl QuotaGuard {
    pub fn new(counters: CounterStore, registry: Arc<RestrictionsRegistry>) -> Self {
        Self { counters, registry }
    }

    /// Reserves one `entity_type` slot for `tenant_id`, returning the new usage.
    pub fn reserve(&self, tenant_id: &str, entity_type: EntityType) -> Result<i64, CoreError> {
        let limit = self.registry.for_tenant(tenant_id).quota(entity_type);
        let usage = self
            .counters
            .increment(USAGE_NAMESPACE, tenant_id, entity_type.as_str(), 1)?;
        if limit > 0 && usage > limit_ceiling(limit) {
            self.counters
                .increment(USAGE_NAMESPACE, tenant_id, entity_type.as_str(), -1)?;
            info!(tenant_id, %entity_type, limit, "quota exceeded");
            return Err(CoreError::QuotaExceeded {
                tenant_id: tenant_id.to_string(),
                entity_type,
                limit,
            });
        }
        Ok(usage)
    }

    /// Returns a slot taken by [`Self::reserve`].
    pub fn release(&self, tenant_id: &str, entity_type: EntityType) -> Result<i64, CoreError> {
        self.counters
            .increment(USAGE_NAMESPACE, tenant_id, entity_type.as_str(), -1)
    }

    pub fn usage(&self, tenant_id: &str, entity_type: EntityType) -> Result<i64, CoreError> {
        self.counters
            .get(USAGE_NAMESPACE, tenant_id, entity_type.as_str())
    }
}

/// Charges API points against `rateLimits.apiPointsPerHour` in fixed windows.
#[derive(Clone)]
pub struct RateLimiter {
    counters: CounterStore,
    registry: Arc<RestrictionsRegistry>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(counters: CounterStore, registry: Arc<RestrictionsRegistry>, window: Duration) -> Self {
        Self {
            counters,
            registry,
            window,
        }
    }

    fn window_key(&self, at: SystemTime) -> String {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let window_secs = self.window.as_secs().max(1);
        format!("points:{}", secs / window_secs)
    }

    pub fn consume(&self, tenant_id: &str, points: u64) -> Result<i64, CoreError> {
        self.consume_at(tenant_id, points, SystemTime::now())
    }

    /// Charges `points` to the window containing `at`. The charge is rolled
    /// back when it pushes the window over the limit.
    pub fn consume_at(&self, tenant_id: &str, points: u64, at: SystemTime) -> Result<i64, CoreError> {
        let limit = self
            .registry
            .for_tenant(tenant_id)
            .rate_limits
            .api_points_per_hour;
        let delta = i64::try_from(points)
            .map_err(|_| CoreError::Validation(format!("api points {points} out of range")))?;
        let key = self.window_key(at);
        let used = self.counters.increment(RATE_NAMESPACE, tenant_id, &key, delta)?;
        if limit > 0 && used > limit_ceiling(limit) {
            self.counters
                .increment(RATE_NAMESPACE, tenant_id, &key, -delta)?;
            warn!(tenant_id, limit, used, "rate limit exceeded");
            return Err(CoreError::RateLimited {
                tenant_id: tenant_id.to_string(),
                limit,
            });
        }
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn guard(restrictions: Restrictions) -> QuotaGuard {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        QuotaGuard::new(counters, Arc::new(RestrictionsRegistry::new(restrictions)))
    }

    #[test]
    fn sixth_reservation_fails_when_quota_is_five() {
        let quotas = guard(Restrictions::default().with_quota(EntityType::Project, 5));
        for expected in 1..=5 {
            assert_eq!(
                quotas.reserve("tn", EntityType::Project).expect("reserve"),
                expected
            );
        }
        let err = quotas
            .reserve("tn", EntityType::Project)
            .expect_err("over quota");
        assert_eq!(err.code_str(), "quota_exceeded");
        assert_eq!(quotas.usage("tn", EntityType::Project).expect("usage"), 5);
    }

    #[test]
    fn zero_quota_is_unlimited() {
        let quotas = guard(Restrictions::default().with_quota(EntityType::Task, 0));
        for _ in 0..50 {
            quotas.reserve("tn", EntityType::Task).expect("reserve");
        }
    }

    #[test]
    fn limits_beyond_the_counter_range_never_trip() {
        let quotas = guard(Restrictions::default().with_quota(EntityType::Task, u64::MAX));
        assert_eq!(quotas.reserve("tn", EntityType::Task).expect("reserve"), 1);

        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        let registry = Arc::new(RestrictionsRegistry::new(
            Restrictions::default().with_api_points_per_hour(u64::MAX),
        ));
        let limiter = RateLimiter::new(counters, registry, Duration::from_secs(3600));
        assert_eq!(limiter.consume("tn", 100).expect("charge"), 100);
    }

    #[test]
    fn released_slots_can_be_reused() {
        let quotas = guard(Restrictions::default().with_quota(EntityType::Attachment, 1));
        quotas.reserve("tn", EntityType::Attachment).expect("first");
        assert!(quotas.reserve("tn", EntityType::Attachment).is_err());
        quotas.release("tn", EntityType::Attachment).expect("release");
        quotas.reserve("tn", EntityType::Attachment).expect("reuse");
    }

    #[test]
    fn tenant_override_replaces_default() {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        let registry = Arc::new(RestrictionsRegistry::new(
            Restrictions::default().with_quota(EntityType::Task, 1),
        ));
        registry.set("big", Restrictions::default().with_quota(EntityType::Task, 3));
        let quotas = QuotaGuard::new(counters, registry);
        for _ in 0..3 {
            quotas.reserve("big", EntityType::Task).expect("reserve");
        }
        quotas.reserve("small", EntityType::Task).expect("reserve");
        assert!(quotas.reserve("small", EntityType::Task).is_err());
    }

    #[test]
    fn rate_limit_windows_reset() {
        let counters = CounterStore::new(Arc::new(MemoryStorage::new()));
        let registry = Arc::new(RestrictionsRegistry::new(
            Restrictions::default().with_api_points_per_hour(10),
        ));
        let limiter = RateLimiter::new(counters, registry, Duration::from_secs(3600));
        let start = UNIX_EPOCH + Duration::from_secs(7200);
        assert_eq!(limiter.consume_at("tn", 6, start).expect("charge"), 6);
        let err = limiter.consume_at("tn", 5, start).expect_err("over");
        assert_eq!(err.code_str(), "rate_limited");
        assert_eq!(limiter.consume_at("tn", 4, start).expect("fits"), 10);
        let next_window = start + Duration::from_secs(3600);
        assert_eq!(limiter.consume_at("tn", 5, next_window).expect("reset"), 5);
    }

    #[test]
    fn restrictions_wire_shape() {
        let restrictions = Restrictions::default()
            .with_quota(EntityType::Project, 5)
            .with_api_points_per_hour(1000);
        let json = serde_json::to_value(&restrictions).expect("encode");
        assert_eq!(
            json,
            serde_json::json!({
                "quotas": { "project": 5 },
                "rateLimits": { "apiPointsPerHour": 1000 }
            })
        );
    }
}
