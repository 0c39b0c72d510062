//! TTL-refreshed in-memory mirror of the persisted rules.
//!
//! The grouped rule map lives behind an `Arc` that is swapped under a
//! short `std::sync::RwLock` write; scoring works on a cloned `Arc`
//! snapshot, so matches never wait on storage. Refreshes are serialized by
//! an async mutex and debounced to one per second, except
//! [`PatternCache::force_refresh`] which always reloads.
//!
//! When a match finds the cache older than its TTL it spawns a detached
//! refresh and scores against the snapshot it already has.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use traq_attribution_core::context::AssignmentContext;
use traq_attribution_core::matcher::{group_by_project, match_context, GroupedPatterns, RuleMatch};
use traq_attribution_core::store::Store;

use crate::db::is_missing_table;

/// Minimum spacing between two non-forced refreshes.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(1);

struct CacheState {
    patterns: Arc<GroupedPatterns>,
    last_refresh: Option<Instant>,
}

pub struct PatternCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    state: RwLock<CacheState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PatternCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            state: RwLock::new(CacheState {
                patterns: Arc::new(GroupedPatterns::new()),
                last_refresh: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn last_refresh(&self) -> Option<Instant> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refresh
    }

    /// Current grouped rules.
    pub fn snapshot(&self) -> Arc<GroupedPatterns> {
        Arc::clone(
            &self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .patterns,
        )
    }

    /// Number of cached rules across all projects.
    pub fn len(&self) -> usize {
        self.snapshot().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stale(&self) -> bool {
        self.last_refresh()
            .map_or(true, |last| last.elapsed() >= self.ttl)
    }

    /// Reload from storage unless the last refresh was under a second ago.
    pub async fn refresh(&self) {
        self.reload(false).await;
    }

    /// Reload from storage unconditionally.
    pub async fn force_refresh(&self) {
        self.reload(true).await;
    }

    async fn reload(&self, force: bool) {
        let _guard = self.refresh_lock.lock().await;

        if !force {
            if let Some(last) = self.last_refresh() {
                if last.elapsed() < REFRESH_DEBOUNCE {
                    return;
                }
            }
        }

        let grouped = match self.store.list_all_patterns().await {
            Ok(patterns) => group_by_project(patterns),
            Err(e) if is_missing_table(&e) => {
                debug!("pattern table not created yet; starting with an empty rule cache");
                GroupedPatterns::new()
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "failed to refresh pattern cache");
                GroupedPatterns::new()
            }
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.patterns = Arc::new(grouped);
        state.last_refresh = Some(Instant::now());
    }

    /// Score a context against the cached rules.
    pub fn match_context(self: &Arc<Self>, ctx: &AssignmentContext) -> Option<RuleMatch> {
        if self.is_stale() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cache = Arc::clone(self);
                handle.spawn(async move { cache.refresh().await });
            }
        }
        match_context(&self.snapshot(), ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traq_attribution_core::models::{MatchType, PatternSpec, PatternType};
    use traq_attribution_core::store::memory::InMemoryStore;

    fn app_rule(project_id: i64, app: &str) -> PatternSpec {
        PatternSpec {
            project_id,
            pattern_type: PatternType::AppName,
            pattern_value: app.to_string(),
            match_type: MatchType::Exact,
            weight: 1.0,
        }
    }

    fn code_ctx() -> AssignmentContext {
        AssignmentContext {
            app_name: Some("Code".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_loads_grouped_rules() {
        let store = Arc::new(InMemoryStore::new());
        let p = store.create_project("Traq", "#fff", "").await.unwrap();
        store.create_pattern(&app_rule(p.id, "code")).await.unwrap();

        let cache = Arc::new(PatternCache::new(store, Duration::from_secs(300)));
        assert!(cache.is_stale());
        cache.refresh().await;
        assert!(!cache.is_stale());
        assert_eq!(cache.len(), 1);

        let m = cache.match_context(&code_ctx()).unwrap();
        assert_eq!(m.project_id, p.id);
    }

    #[tokio::test]
    async fn test_refresh_is_debounced_but_force_is_not() {
        let store = Arc::new(InMemoryStore::new());
        let p = store.create_project("Traq", "#fff", "").await.unwrap();
        let cache = PatternCache::new(store.clone(), Duration::from_secs(300));
        cache.refresh().await;
        assert!(cache.is_empty());

        store.create_pattern(&app_rule(p.id, "code")).await.unwrap();
        cache.refresh().await;
        assert!(cache.is_empty());

        cache.force_refresh().await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_still_scores_snapshot() {
        let store = Arc::new(InMemoryStore::new());
        let p = store.create_project("Traq", "#fff", "").await.unwrap();
        store.create_pattern(&app_rule(p.id, "code")).await.unwrap();

        let cache = Arc::new(PatternCache::new(store, Duration::from_millis(1)));
        cache.force_refresh().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.is_stale());
        assert!(cache.match_context(&code_ctx()).is_some());
    }
}
