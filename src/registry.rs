//! Route registry: the single owner of routes and their health records
//!
//! Each route lives in its own `Mutex` inside a `DashMap`, so a probe writing
//! back a result only contends with readers of that one route. Structural
//! mutations (create, update, delete, toggle) are additionally serialized by a
//! registry-wide lock so the enabled-path uniqueness check and the write it
//! guards happen atomically.

use crate::error::RegistryError;
use crate::health::{advance, HealthPolicy, HealthRecord, HealthState, ProbeOutcome};
use crate::route::{validate_path, Route, RouteSpec, TargetPolicy};
use crate::snapshot::{RouteStats, RouteView};
use crate::store::RouteStore;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Who asked for a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOrigin {
    /// Dispatched by the scheduler; dropped if the route stopped being monitored
    Scheduled,
    /// Operator "test now"; applied even to disabled routes
    Manual,
}

/// A route copy handed to a probe, tied to the target generation it was taken from
#[derive(Debug, Clone)]
pub struct ProbeTicket {
    pub route: Route,
    pub generation: u64,
    pub origin: ProbeOrigin,
}

/// Result of applying a probe outcome
#[derive(Debug, Clone, PartialEq)]
pub struct HealthUpdate {
    pub previous: HealthState,
    pub record: HealthRecord,
}

impl HealthUpdate {
    pub fn changed(&self) -> bool {
        self.previous != self.record.state
    }
}

struct RouteEntry {
    /// Insertion order
    seq: u64,
    route: Route,
    health: HealthRecord,
    /// Bumped whenever the target changes so stale probe results are dropped
    generation: u64,
    last_dispatched: Option<Instant>,
}

impl RouteEntry {
    fn new(seq: u64, route: Route) -> Self {
        Self {
            seq,
            route,
            health: HealthRecord::unknown(),
            generation: 0,
            last_dispatched: None,
        }
    }

    fn view(&self) -> RouteView {
        RouteView::new(self.route.clone(), self.health.clone())
    }
}

/// Concurrent store of routes and their health
pub struct Registry {
    entries: DashMap<String, Mutex<RouteEntry>>,
    next_seq: AtomicU64,
    write_lock: Mutex<()>,
    policy: TargetPolicy,
    store: Option<Arc<dyn RouteStore>>,
}

impl Registry {
    pub fn new(policy: TargetPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            policy,
            store: None,
        }
    }

    /// Persist route definitions to `store` after every mutation
    pub fn with_store(mut self, store: Arc<dyn RouteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policy(&self) -> &TargetPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load previously persisted routes, keeping their ids.
    ///
    /// Returns the number of routes restored; routes that no longer validate
    /// or collide with an enabled path are skipped with an error log.
    pub fn restore(&self, routes: Vec<Route>) -> usize {
        let _guard = self.write_lock.lock();
        let mut restored = 0;

        for mut route in routes {
            let fields = match route.to_spec().validate(&self.policy) {
                Ok(fields) => fields,
                Err(e) => {
                    error!(route_id = %route.id, error = %e, "Skipping invalid persisted route");
                    continue;
                }
            };
            if self.entries.contains_key(&route.id) {
                error!(route_id = %route.id, "Skipping persisted route with duplicate id");
                continue;
            }
            if fields.enabled {
                if let Err(e) = self.ensure_path_available(&fields.path, None) {
                    error!(route_id = %route.id, error = %e, "Skipping persisted route");
                    continue;
                }
            }

            let updated_at = route.updated_at;
            route.apply_fields(fields, updated_at);
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.entries
                .insert(route.id.clone(), Mutex::new(RouteEntry::new(seq, route)));
            restored += 1;
        }

        restored
    }

    pub fn create(&self, spec: RouteSpec) -> Result<Route, RegistryError> {
        let fields = spec.validate(&self.policy)?;

        let _guard = self.write_lock.lock();
        if fields.enabled {
            self.ensure_path_available(&fields.path, None)?;
        }

        let route = Route::from_fields(uuid::Uuid::new_v4().to_string(), fields, Utc::now());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .insert(route.id.clone(), Mutex::new(RouteEntry::new(seq, route.clone())));

        info!(
            route_id = %route.id,
            path = %route.path,
            target = %route.target_url(),
            enabled = route.enabled,
            "Route created"
        );
        self.persist();
        Ok(route)
    }

    /// Replace a route's definition.
    ///
    /// Changing the target resets the health record to UNKNOWN and discards
    /// results of probes still running against the old target.
    pub fn update(&self, id: &str, spec: RouteSpec) -> Result<Route, RegistryError> {
        let fields = spec.validate(&self.policy)?;

        let _guard = self.write_lock.lock();
        if !self.entries.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        if fields.enabled {
            self.ensure_path_available(&fields.path, Some(id))?;
        }

        let route = {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let mut entry = entry.lock();

            let before = entry.route.clone();
            entry.route.apply_fields(fields, Utc::now());
            if !before.same_target(&entry.route) {
                entry.generation += 1;
                entry.health = HealthRecord::unknown();
                entry.last_dispatched = None;
                debug!(route_id = id, "Route target changed, health reset");
            }
            entry.route.clone()
        };

        info!(route_id = id, path = %route.path, target = %route.target_url(), "Route updated");
        self.persist();
        Ok(route)
    }

    /// Remove a route and its health record together
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock();
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        info!(route_id = id, path = %entry.lock().route.path, "Route deleted");
        self.persist();
        Ok(())
    }

    /// Flip `enabled`, returning the new value.
    ///
    /// Re-enabling fails with `DuplicatePath` if another enabled route took
    /// the path in the meantime. The health record is kept as is.
    pub fn toggle(&self, id: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock();

        let (enabled, path) = {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let entry = entry.lock();
            (entry.route.enabled, entry.route.path.clone())
        };
        if !enabled {
            self.ensure_path_available(&path, Some(id))?;
        }

        {
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let mut entry = entry.lock();
            entry.route.enabled = !enabled;
            entry.route.updated_at = Utc::now();
        }

        info!(route_id = id, path = %path, enabled = !enabled, "Route toggled");
        self.persist();
        Ok(!enabled)
    }

    pub fn get(&self, id: &str) -> Result<Route, RegistryError> {
        self.with_entry(id, |entry| entry.route.clone())
    }

    pub fn health(&self, id: &str) -> Result<HealthRecord, RegistryError> {
        self.with_entry(id, |entry| entry.health.clone())
    }

    pub fn view(&self, id: &str) -> Result<RouteView, RegistryError> {
        self.with_entry(id, RouteEntry::view)
    }

    /// Find a route by its public path, preferring an enabled one
    pub fn get_by_path(&self, path: &str) -> Option<Route> {
        let wanted = validate_path(path).ok()?;
        let mut matches: Vec<Route> = self
            .list()
            .into_iter()
            .filter(|route| route.path == wanted)
            .collect();
        let enabled = matches.iter().position(|route| route.enabled);
        match enabled {
            Some(idx) => Some(matches.swap_remove(idx)),
            None => matches.into_iter().next(),
        }
    }

    /// All routes in insertion order
    pub fn list(&self) -> Vec<Route> {
        self.ordered(|entry| entry.route.clone())
    }

    /// Routes paired with their health, in insertion order.
    ///
    /// Each pair is read under one lock; different routes may be observed at
    /// slightly different moments.
    pub fn snapshot(&self) -> Vec<RouteView> {
        self.ordered(RouteEntry::view)
    }

    pub fn stats(&self) -> RouteStats {
        RouteStats::from_views(&self.snapshot())
    }

    /// Overwrite a route's health record. Returns false if the route is gone.
    pub fn record_health(&self, id: &str, record: HealthRecord) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.lock().health = record;
                true
            }
            None => false,
        }
    }

    /// Run the state machine for a finished probe.
    ///
    /// The outcome is discarded (returns `None`) when the route was deleted,
    /// its target changed since the ticket was issued, or, for scheduled
    /// probes, monitoring was switched off in the meantime.
    pub fn apply_outcome(
        &self,
        ticket: &ProbeTicket,
        outcome: &ProbeOutcome,
        policy: &HealthPolicy,
    ) -> Option<HealthUpdate> {
        let entry = self.entries.get(&ticket.route.id)?;
        let mut entry = entry.lock();

        if entry.generation != ticket.generation {
            return None;
        }
        if ticket.origin == ProbeOrigin::Scheduled
            && !(entry.route.enabled && entry.route.health_check_enabled)
        {
            return None;
        }

        let previous = entry.health.state;
        entry.health = advance(&entry.health, outcome, policy, Utc::now());
        Some(HealthUpdate {
            previous,
            record: entry.health.clone(),
        })
    }

    /// Issue a ticket for an immediate probe of one route
    pub fn ticket(&self, id: &str, origin: ProbeOrigin) -> Result<ProbeTicket, RegistryError> {
        self.with_entry(id, |entry| ProbeTicket {
            route: entry.route.clone(),
            generation: entry.generation,
            origin,
        })
    }

    /// Select enabled, monitored routes whose interval has elapsed, marking
    /// them dispatched at `now`.
    ///
    /// Routes for which `busy` returns true are left unmarked, so they are
    /// claimed on the first tick after their running probe finishes.
    pub fn claim_due(
        &self,
        now: Instant,
        default_interval: Duration,
        busy: impl Fn(&str) -> bool,
    ) -> Vec<ProbeTicket> {
        let mut due: Vec<(u64, ProbeTicket)> = Vec::new();

        for item in self.entries.iter() {
            let mut entry = item.value().lock();
            if !(entry.route.enabled && entry.route.health_check_enabled) {
                continue;
            }
            if busy(&entry.route.id) {
                continue;
            }

            let interval = entry.route.check_interval(default_interval);
            let is_due = entry
                .last_dispatched
                .map_or(true, |last| now.saturating_duration_since(last) >= interval);
            if !is_due {
                continue;
            }

            entry.last_dispatched = Some(now);
            due.push((
                entry.seq,
                ProbeTicket {
                    route: entry.route.clone(),
                    generation: entry.generation,
                    origin: ProbeOrigin::Scheduled,
                },
            ));
        }

        due.sort_by_key(|(seq, _)| *seq);
        due.into_iter().map(|(_, ticket)| ticket).collect()
    }

    fn with_entry<T>(&self, id: &str, f: impl FnOnce(&RouteEntry) -> T) -> Result<T, RegistryError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let entry = entry.lock();
        Ok(f(&entry))
    }

    fn ordered<T>(&self, f: impl Fn(&RouteEntry) -> T) -> Vec<T> {
        let mut items: Vec<(u64, T)> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item.value().lock();
                (entry.seq, f(&entry))
            })
            .collect();
        items.sort_by_key(|(seq, _)| *seq);
        items.into_iter().map(|(_, item)| item).collect()
    }

    /// Caller must hold `write_lock`
    fn ensure_path_available(&self, path: &str, except_id: Option<&str>) -> Result<(), RegistryError> {
        let taken = self.entries.iter().any(|item| {
            if Some(item.key().as_str()) == except_id {
                return false;
            }
            let entry = item.value().lock();
            entry.route.enabled && entry.route.path == path
        });

        if taken {
            return Err(RegistryError::DuplicatePath(path.to_string()));
        }
        Ok(())
    }

    /// Caller must hold `write_lock`
    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.list()) {
                error!(error = %e, "Failed to persist routes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FailureKind;
    use crate::store::JsonFileStore;

    fn registry() -> Registry {
        Registry::new(TargetPolicy::default())
    }

    fn spec(path: &str) -> RouteSpec {
        RouteSpec::new(path, "Service", "192.168.1.50", 8080)
    }

    #[test]
    fn test_create_then_get_round_trip() {
        let registry = registry();
        let submitted = spec("/media").with_target_path("/health").with_timeout(10);
        let created = registry.create(submitted.clone()).unwrap();

        let fetched = registry.get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.to_spec(), submitted);
        assert_eq!(registry.health(&created.id).unwrap().state, HealthState::Unknown);
    }

    #[test]
    fn test_validation_error_has_no_side_effect() {
        let registry = registry();
        let err = registry
            .create(RouteSpec::new("/a", "A", "10.0.0.1", 80).with_timeout(0))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_enabled_path_rejected() {
        let registry = registry();
        registry.create(spec("/media")).unwrap();

        let err = registry.create(spec("/media/")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicatePath("/media".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disabled_routes_may_share_path() {
        let registry = registry();
        registry.create(spec("/media")).unwrap();
        let disabled = registry.create(spec("/media").with_enabled(false)).unwrap();

        // Enabling would collide with the first route
        let err = registry.toggle(&disabled.id).unwrap_err();
        assert_eq!(err.kind(), "duplicate_path");
        assert!(!registry.get(&disabled.id).unwrap().enabled);
    }

    #[test]
    fn test_toggle_flips_only_enabled() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();

        assert!(!registry.toggle(&route.id).unwrap());
        let toggled = registry.get(&route.id).unwrap();
        assert!(!toggled.enabled);
        assert_eq!(toggled.to_spec(), spec("/media").with_enabled(false));
        assert_eq!(toggled.created_at, route.created_at);

        assert!(registry.toggle(&route.id).unwrap());
        assert!(registry.get(&route.id).unwrap().enabled);
    }

    #[test]
    fn test_toggle_keeps_health() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();
        let ticket = registry.ticket(&route.id, ProbeOrigin::Manual).unwrap();
        registry.apply_outcome(&ticket, &ProbeOutcome::success(200, 5), &HealthPolicy::default());

        registry.toggle(&route.id).unwrap();
        assert_eq!(registry.health(&route.id).unwrap().state, HealthState::Up);
    }

    #[test]
    fn test_not_found_errors() {
        let registry = registry();
        assert_eq!(registry.get("missing").unwrap_err().kind(), "not_found");
        assert_eq!(registry.delete("missing").unwrap_err().kind(), "not_found");
        assert_eq!(registry.toggle("missing").unwrap_err().kind(), "not_found");
        assert_eq!(
            registry.update("missing", spec("/x")).unwrap_err().kind(),
            "not_found"
        );
        assert!(!registry.record_health("missing", HealthRecord::unknown()));
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let registry = registry();
        let paths = ["/c", "/a", "/b", "/d"];
        for path in paths {
            registry.create(spec(path)).unwrap();
        }
        let listed: Vec<String> = registry.list().into_iter().map(|r| r.path).collect();
        assert_eq!(listed, paths);
    }

    #[test]
    fn test_delete_removes_route_and_health() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();
        registry.delete(&route.id).unwrap();

        assert!(registry.get(&route.id).is_err());
        assert!(registry.health(&route.id).is_err());
        assert!(registry.list().is_empty());
        // Path is free again
        registry.create(spec("/media")).unwrap();
    }

    #[test]
    fn test_outcome_for_deleted_route_is_discarded() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();
        let ticket = registry.ticket(&route.id, ProbeOrigin::Scheduled).unwrap();
        registry.delete(&route.id).unwrap();

        let update = registry.apply_outcome(
            &ticket,
            &ProbeOutcome::success(200, 5),
            &HealthPolicy::default(),
        );
        assert!(update.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_target_change_resets_health_and_drops_stale_results() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();
        let stale = registry.ticket(&route.id, ProbeOrigin::Scheduled).unwrap();
        registry.apply_outcome(&stale, &ProbeOutcome::success(200, 5), &HealthPolicy::default());

        let mut changed = spec("/media");
        changed.target_port = 9090;
        registry.update(&route.id, changed).unwrap();
        assert_eq!(registry.health(&route.id).unwrap(), HealthRecord::unknown());

        let update = registry.apply_outcome(
            &stale,
            &ProbeOutcome::failure(FailureKind::OfflineConn, "refused", 1),
            &HealthPolicy::default(),
        );
        assert!(update.is_none());
        assert_eq!(registry.health(&route.id).unwrap().state, HealthState::Unknown);
    }

    #[test]
    fn test_rename_keeps_health() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();
        let ticket = registry.ticket(&route.id, ProbeOrigin::Manual).unwrap();
        registry.apply_outcome(&ticket, &ProbeOutcome::success(200, 5), &HealthPolicy::default());

        let mut renamed = spec("/media");
        renamed.name = "Renamed".to_string();
        let updated = registry.update(&route.id, renamed).unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.created_at, route.created_at);
        assert_eq!(registry.health(&route.id).unwrap().state, HealthState::Up);
    }

    #[test]
    fn test_scheduled_result_dropped_for_disabled_route() {
        let registry = registry();
        let route = registry.create(spec("/media")).unwrap();
        let ticket = registry.ticket(&route.id, ProbeOrigin::Scheduled).unwrap();
        registry.toggle(&route.id).unwrap();

        let update = registry.apply_outcome(
            &ticket,
            &ProbeOutcome::success(200, 5),
            &HealthPolicy::default(),
        );
        assert!(update.is_none());

        let manual = registry.ticket(&route.id, ProbeOrigin::Manual).unwrap();
        let update = registry
            .apply_outcome(&manual, &ProbeOutcome::success(200, 5), &HealthPolicy::default())
            .unwrap();
        assert!(update.changed());
        assert_eq!(update.record.state, HealthState::Up);
    }

    #[tokio::test]
    async fn test_claim_due_respects_intervals_and_flags() {
        let registry = registry();
        let monitored = registry.create(spec("/a")).unwrap();
        registry.create(spec("/b").with_enabled(false)).unwrap();
        registry.create(spec("/c").with_health_check(false)).unwrap();
        let fast = registry.create(spec("/d").with_check_interval(1)).unwrap();

        let start = Instant::now();
        let interval = Duration::from_secs(60);

        let due: Vec<String> = registry
            .claim_due(start, interval, |_| false)
            .into_iter()
            .map(|t| t.route.id)
            .collect();
        assert_eq!(due, vec![monitored.id.clone(), fast.id.clone()]);

        assert!(registry.claim_due(start, interval, |_| false).is_empty());

        let due: Vec<String> = registry
            .claim_due(start + Duration::from_secs(2), interval, |_| false)
            .into_iter()
            .map(|t| t.route.id)
            .collect();
        assert_eq!(due, vec![fast.id.clone()]);

        let due = registry.claim_due(start + Duration::from_secs(61), interval, |_| false);
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_busy_route_is_claimed_once_its_probe_finishes() {
        let registry = registry();
        let slow = registry.create(spec("/slow").with_check_interval(10)).unwrap();

        let start = Instant::now();
        let interval = Duration::from_secs(60);
        assert_eq!(registry.claim_due(start, interval, |_| false).len(), 1);

        // Still probing when the next interval comes around
        let later = start + Duration::from_secs(10);
        assert!(registry.claim_due(later, interval, |id| id == slow.id).is_empty());

        // Probe finished a second later: due right away, not a full interval on
        let due = registry.claim_due(later + Duration::from_secs(1), interval, |_| false);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].route.id, slow.id);
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let registry = registry();
        let err = registry
            .create(RouteSpec::new("/a", "A", "10.0.0.1", 80).with_timeout(i64::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_by_path_prefers_enabled() {
        let registry = registry();
        registry.create(spec("/media").with_enabled(false)).unwrap();
        let live = registry.create(spec("/media")).unwrap();

        assert_eq!(registry.get_by_path("media/").unwrap().id, live.id);
        assert!(registry.get_by_path("/other").is_none());
        assert!(registry.get_by_path("bad path").is_none());
    }

    #[test]
    fn test_concurrent_create_same_path() {
        let registry = Arc::new(registry());
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.create(spec("/shared"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(RegistryError::DuplicatePath(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(dup, 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mutations_are_persisted_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("routes.json")));

        let registry = Registry::new(TargetPolicy::default()).with_store(store.clone());
        let a = registry.create(spec("/a")).unwrap();
        let b = registry.create(spec("/b")).unwrap();
        registry.toggle(&a.id).unwrap();
        registry.delete(&b.id).unwrap();

        let restored = Registry::new(TargetPolicy::default());
        assert_eq!(restored.restore(store.load().unwrap()), 1);
        let routes = restored.list();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].id, a.id);
        assert!(!routes[0].enabled);
        assert_eq!(restored.health(&a.id).unwrap().state, HealthState::Unknown);
    }

    #[test]
    fn test_restore_skips_conflicts() {
        let source = registry();
        let a = source.create(spec("/a")).unwrap();
        let mut clash = a.clone();
        clash.id = "other".to_string();

        let restored = registry();
        assert_eq!(restored.restore(vec![a, clash]), 1);
    }
}
