//! Permission resolution and checks.
//!
//! Effective permission sets come from the permission RPC and are cached per
//! `(user, organization)` for a fixed TTL. Membership writes must call
//! [`PermissionEngine::invalidate`] so a downgrade takes effect immediately.
//! A fetch that straddles an invalidation is returned to its caller but never
//! cached: each slot carries a generation bumped on invalidation, and
//! organization-wide invalidation bumps a shared epoch.

use crate::config::PermissionCacheConfig;
use crate::models::permission::evaluate_conditions;
use crate::models::{
    MatchKind, PermissionCheck, PermissionCondition, PermissionDecision, PermissionSet,
};
use crate::services::error::TenancyError;
use crate::services::store::{ConditionStore, PermissionRpc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedPermissions {
    set: Arc<PermissionSet>,
    fetched_at: Instant,
}

#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    entry: Option<CachedPermissions>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Clone)]
pub struct PermissionEngine {
    rpc: Arc<dyn PermissionRpc>,
    conditions: Arc<dyn ConditionStore>,
    cache: Arc<DashMap<(String, String), CacheSlot>>,
    epoch: Arc<AtomicU64>,
    ttl: Duration,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl PermissionEngine {
    pub fn new(
        rpc: Arc<dyn PermissionRpc>,
        conditions: Arc<dyn ConditionStore>,
        config: &PermissionCacheConfig,
    ) -> Self {
        Self {
            rpc,
            conditions,
            cache: Arc::new(DashMap::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            ttl: config.ttl(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Effective permissions for `(user, organization)`, served from cache
    /// while fresh. Concurrent misses may both call the RPC; last write wins.
    pub async fn get_user_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Arc<PermissionSet>, TenancyError> {
        let key = (user_id.to_string(), organization_id.to_string());

        let epoch = self.epoch.load(Ordering::SeqCst);
        let (generation, cached) = match self.cache.get(&key) {
            Some(slot) => (
                slot.generation,
                slot.entry
                    .as_ref()
                    .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
                    .map(|entry| entry.set.clone()),
            ),
            None => (0, None),
        };
        if let Some(set) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(set);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let grants = self
            .rpc
            .effective_permissions(user_id, organization_id)
            .await
            .map_err(|e| {
                tracing::warn!(
                    user_id = %user_id,
                    organization_id = %organization_id,
                    error = %e,
                    "Failed to fetch effective permissions"
                );
                TenancyError::Store(e)
            })?;

        let set = Arc::new(PermissionSet::new(grants));

        // Checked under the slot's shard lock, which invalidation also takes.
        let mut slot = self.cache.entry(key).or_default();
        if slot.generation == generation && self.epoch.load(Ordering::SeqCst) == epoch {
            slot.entry = Some(CachedPermissions {
                set: set.clone(),
                fetched_at: Instant::now(),
            });
            tracing::debug!(
                user_id = %user_id,
                organization_id = %organization_id,
                count = set.len(),
                "Cached effective permissions"
            );
        } else {
            tracing::debug!(
                user_id = %user_id,
                organization_id = %organization_id,
                "Membership changed during fetch, result not cached"
            );
        }
        Ok(set)
    }

    pub fn invalidate(&self, user_id: &str, organization_id: &str) {
        let mut slot = self
            .cache
            .entry((user_id.to_string(), organization_id.to_string()))
            .or_default();
        slot.generation += 1;
        slot.entry = None;
        drop(slot);
        tracing::debug!(user_id = %user_id, organization_id = %organization_id, "Permission cache invalidated");
    }

    pub fn invalidate_organization(&self, organization_id: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.retain(|(_, org), _| org != organization_id);
        tracing::debug!(organization_id = %organization_id, "Permission cache invalidated for organization");
    }

    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.iter().filter(|slot| slot.entry.is_some()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub async fn check_permission(
        &self,
        check: &PermissionCheck,
    ) -> Result<PermissionDecision, TenancyError> {
        let set = self
            .get_user_permissions(&check.user_id, &check.organization_id)
            .await?;
        self.check_against(&set, check).await
    }

    /// Check using an already resolved set.
    pub async fn check_against(
        &self,
        set: &PermissionSet,
        check: &PermissionCheck,
    ) -> Result<PermissionDecision, TenancyError> {
        let permission = check.permission();

        if let Some(kind) = set.grants(&check.resource, &check.action) {
            return Ok(PermissionDecision::allow(kind));
        }

        let Some(context) = &check.context else {
            return Ok(PermissionDecision::missing(&permission));
        };

        let raw = self
            .conditions
            .find_conditions(&check.organization_id, &check.user_id, &permission)
            .await?;
        if raw.is_empty() {
            return Ok(PermissionDecision::missing(&permission));
        }

        let conditions = match raw
            .into_iter()
            .map(PermissionCondition::from_value)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(conditions) => conditions,
            Err(e) => {
                tracing::warn!(
                    user_id = %check.user_id,
                    organization_id = %check.organization_id,
                    permission = %permission,
                    error = %e,
                    "Rejected malformed permission condition"
                );
                return Ok(PermissionDecision::deny(format!(
                    "Invalid conditions for permission: {}",
                    permission
                )));
            }
        };

        if evaluate_conditions(&conditions, context) {
            Ok(PermissionDecision::allow(MatchKind::Conditional))
        } else {
            Ok(PermissionDecision::deny(format!(
                "Conditions not met for permission: {}",
                permission
            )))
        }
    }

    /// True if any listed `resource:action` token is granted.
    pub async fn has_any_permission(
        &self,
        user_id: &str,
        organization_id: &str,
        permissions: &[&str],
    ) -> Result<bool, TenancyError> {
        let set = self.get_user_permissions(user_id, organization_id).await?;
        Ok(set.grants_any(permissions))
    }

    /// True if every listed token is granted. An empty list is vacuously true.
    pub async fn has_all_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
        permissions: &[&str],
    ) -> Result<bool, TenancyError> {
        let set = self.get_user_permissions(user_id, organization_id).await?;
        Ok(set.grants_all(permissions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberRole, Membership};
    use crate::services::memory::MockDatastore;
    use serde_json::json;

    fn engine(store: &Arc<MockDatastore>) -> PermissionEngine {
        PermissionEngine::new(
            store.clone(),
            store.clone(),
            &PermissionCacheConfig::default(),
        )
    }

    fn seeded(role: MemberRole, grants: &[&str]) -> Arc<MockDatastore> {
        let store = Arc::new(MockDatastore::new());
        store.add_membership(
            Membership::new("u1", "o1", role)
                .with_permissions(grants.iter().map(|g| g.to_string()).collect()),
        );
        store
    }

    #[tokio::test]
    async fn test_cache_hit_skips_rpc() {
        let store = seeded(MemberRole::Viewer, &[]);
        let engine = engine(&store);

        let first = engine.get_user_permissions("u1", "o1").await.unwrap();
        let second = engine.get_user_permissions("u1", "o1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.rpc_call_count(), 1);
        assert_eq!(engine.cache_stats().hits, 1);
        assert_eq!(engine.cache_stats().misses, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let store = seeded(MemberRole::Viewer, &[]);
        let engine = PermissionEngine::new(
            store.clone(),
            store.clone(),
            &PermissionCacheConfig {
                cache_ttl_seconds: 0,
            },
        );
        engine.get_user_permissions("u1", "o1").await.unwrap();
        engine.get_user_permissions("u1", "o1").await.unwrap();
        assert_eq!(store.rpc_call_count(), 2);
    }

    /// Holds the first RPC call open until released.
    struct PausedRpc {
        store: Arc<MockDatastore>,
        paused: std::sync::atomic::AtomicBool,
        fetched: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl PermissionRpc for PausedRpc {
        async fn effective_permissions(
            &self,
            user_id: &str,
            organization_id: &str,
        ) -> Result<Vec<String>, anyhow::Error> {
            let grants = self.store.effective_permissions(user_id, organization_id).await;
            if self.paused.swap(false, Ordering::SeqCst) {
                self.fetched.notify_one();
                self.release.notified().await;
            }
            grants
        }
    }

    #[tokio::test]
    async fn test_fetch_racing_invalidation_is_not_cached() {
        let store = seeded(MemberRole::Admin, &[]);
        let rpc = Arc::new(PausedRpc {
            store: store.clone(),
            paused: std::sync::atomic::AtomicBool::new(true),
            fetched: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let engine = PermissionEngine::new(
            rpc.clone(),
            store.clone(),
            &PermissionCacheConfig::default(),
        );

        let in_flight = tokio::spawn({
            let engine = engine.clone();
            async move { engine.get_user_permissions("u1", "o1").await }
        });
        rpc.fetched.notified().await;

        store.add_membership(Membership::new("u1", "o1", MemberRole::Viewer));
        engine.invalidate("u1", "o1");
        rpc.release.notify_one();

        let old = in_flight.await.unwrap().unwrap();
        assert!(old.grants("workspace", "delete").is_some());
        assert_eq!(engine.cache_stats().entries, 0);

        let current = engine.get_user_permissions("u1", "o1").await.unwrap();
        assert!(current.grants("workspace", "delete").is_none());
        assert!(current.grants("workspace", "view").is_some());
        assert_eq!(store.rpc_call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_organization_only_drops_that_org() {
        let store = seeded(MemberRole::Viewer, &[]);
        store.add_membership(Membership::new("u1", "o2", MemberRole::Viewer));
        let engine = engine(&store);
        engine.get_user_permissions("u1", "o1").await.unwrap();
        engine.get_user_permissions("u1", "o2").await.unwrap();

        engine.invalidate_organization("o1");
        assert_eq!(engine.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn test_resource_wildcard_allows_delete() {
        let store = seeded(MemberRole::Member, &["workspace:view", "project:*"]);
        let engine = engine(&store);
        let decision = engine
            .check_permission(&PermissionCheck::new("u1", "o1", "project", "delete"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.matched_by, Some(MatchKind::ResourceWildcard));
    }

    #[tokio::test]
    async fn test_viewer_denied_create_names_permission() {
        let store = seeded(MemberRole::Viewer, &[]);
        let engine = engine(&store);
        let decision = engine
            .check_permission(&PermissionCheck::new("u1", "o1", "workspace", "create"))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("workspace:create"));
    }

    #[tokio::test]
    async fn test_conditional_grant() {
        let store = seeded(MemberRole::Member, &[]);
        store.add_conditions(
            "o1",
            "u1",
            "invoice:approve",
            vec![json!({"field": "request.amount", "operator": "lte", "value": 1000})],
        );
        let engine = engine(&store);
        let check = PermissionCheck::new("u1", "o1", "invoice", "approve");

        let small = engine
            .check_permission(&check.clone().with_context(json!({"request": {"amount": 500}})))
            .await
            .unwrap();
        assert!(small.allowed);
        assert_eq!(small.matched_by, Some(MatchKind::Conditional));

        let large = engine
            .check_permission(&check.clone().with_context(json!({"request": {"amount": 5000}})))
            .await
            .unwrap();
        assert!(!large.allowed);

        let no_context = engine.check_permission(&check).await.unwrap();
        assert!(!no_context.allowed);
    }

    #[tokio::test]
    async fn test_unknown_operator_fails_closed() {
        let store = seeded(MemberRole::Member, &[]);
        store.add_conditions(
            "o1",
            "u1",
            "invoice:approve",
            vec![json!({"field": "amount", "operator": "regex", "value": ".*"})],
        );
        let engine = engine(&store);
        let decision = engine
            .check_permission(
                &PermissionCheck::new("u1", "o1", "invoice", "approve")
                    .with_context(json!({"amount": 1})),
            )
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_any_and_all() {
        let store = seeded(MemberRole::Viewer, &[]);
        let engine = engine(&store);
        assert!(engine
            .has_any_permission("u1", "o1", &["workspace:create", "workspace:view"])
            .await
            .unwrap());
        assert!(!engine
            .has_all_permissions("u1", "o1", &["workspace:create", "workspace:view"])
            .await
            .unwrap());

        let owner = seeded(MemberRole::Owner, &[]);
        let engine = super::PermissionEngine::new(
            owner.clone(),
            owner.clone(),
            &PermissionCacheConfig::default(),
        );
        assert!(engine
            .has_all_permissions("u1", "o1", &["billing:refund", "anything"])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rpc_failure_surfaces_as_store_error() {
        let store = seeded(MemberRole::Viewer, &[]);
        store.set_rpc_failing(true);
        let engine = engine(&store);
        assert!(matches!(
            engine.get_user_permissions("u1", "o1").await,
            Err(TenancyError::Store(_))
        ));
    }
}
