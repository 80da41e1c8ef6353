//! Health monitor: periodically probes every monitored route
//!
//! A single loop ticks at a fixed interval, claims the routes whose own check
//! interval has elapsed and spawns one probe task per route. A semaphore bounds
//! how many probes hit the network at once; manual tests draw from the same
//! permits and feed the same state machine.

use crate::error::RegistryError;
use crate::health::{FailureKind, HealthPolicy, HealthState, ProbeOutcome};
use crate::prober::Prober;
use crate::registry::{ProbeOrigin, ProbeTicket, Registry};
use crate::snapshot::TestReport;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due routes are looked for
    pub tick_interval: Duration,
    /// Check interval for routes without their own
    pub check_interval: Duration,
    /// Upper bound on simultaneously running probes
    pub max_concurrent_probes: usize,
    /// Extra time past a route's timeout before its probe task is aborted
    pub probe_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            check_interval: Duration::from_secs(300),
            max_concurrent_probes: 16,
            probe_grace: Duration::from_secs(1),
        }
    }
}

/// Drives probes for all routes and records their results
pub struct HealthMonitor<P: Prober> {
    registry: Arc<Registry>,
    prober: Arc<P>,
    policy: HealthPolicy,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    /// Routes with a scheduled probe still running
    in_flight: DashSet<String>,
}

impl<P: Prober> HealthMonitor<P> {
    pub fn new(
        registry: Arc<Registry>,
        prober: Arc<P>,
        policy: HealthPolicy,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_probes.max(1)));
        Arc::new(Self {
            registry,
            prober,
            policy,
            config,
            permits,
            in_flight: DashSet::new(),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run the scheduling loop until shutdown is signalled.
    ///
    /// Probes still running at shutdown are aborted.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            check_interval_secs = self.config.check_interval.as_secs(),
            max_concurrent_probes = self.config.max_concurrent_probes,
            "Health monitor started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dispatched = self.tick(&mut tasks);
                    if dispatched > 0 {
                        debug!(dispatched, running = tasks.len(), "Probes dispatched");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }

        tasks.shutdown().await;
        self.in_flight.clear();
    }

    /// Dispatch probes for every due route; returns how many were spawned
    pub fn tick(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> usize {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Probe task panicked");
                }
            }
        }

        let mut dispatched = 0;
        let in_flight = &self.in_flight;
        for ticket in self
            .registry
            .claim_due(Instant::now(), self.config.check_interval, |id| {
                in_flight.contains(id)
            })
        {
            // One scheduled probe per route at a time
            if !self.in_flight.insert(ticket.route.id.clone()) {
                continue;
            }

            let monitor = Arc::clone(self);
            tasks.spawn(async move {
                let id = ticket.route.id.clone();
                monitor.execute(ticket).await;
                monitor.in_flight.remove(&id);
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Probe a route right away and report the raw outcome.
    ///
    /// Works for disabled routes and routes with monitoring turned off.
    pub async fn test_now(&self, id: &str) -> Result<TestReport, RegistryError> {
        let ticket = self.registry.ticket(id, ProbeOrigin::Manual)?;
        let outcome = self.probe_with_permit(&ticket).await;
        let update = self.registry.apply_outcome(&ticket, &outcome, &self.policy);

        info!(
            route_id = id,
            success = outcome.success,
            duration_ms = outcome.duration_ms,
            detail = %outcome.detail,
            "Manual route test"
        );

        Ok(TestReport::new(
            &outcome,
            &self.policy,
            update.as_ref().map(|u| &u.record),
        ))
    }

    async fn execute(&self, ticket: ProbeTicket) {
        let outcome = self.probe_with_permit(&ticket).await;
        let route = &ticket.route;

        let Some(update) = self.registry.apply_outcome(&ticket, &outcome, &self.policy) else {
            debug!(route_id = %route.id, "Discarding probe result for changed or removed route");
            return;
        };

        if !update.changed() {
            return;
        }
        match update.record.state {
            HealthState::Down => warn!(
                route_id = %route.id,
                path = %route.path,
                previous = %update.previous,
                reason = ?update.record.reason.map(|r| r.as_str()),
                detail = %outcome.detail,
                "Route is down"
            ),
            state => info!(
                route_id = %route.id,
                path = %route.path,
                previous = %update.previous,
                state = %state,
                duration_ms = outcome.duration_ms,
                "Route health changed"
            ),
        }
    }

    async fn probe_with_permit(&self, ticket: &ProbeTicket) -> ProbeOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ProbeOutcome::failure(FailureKind::ErrorExc, "probe pool closed", 0);
            }
        };
        self.run_probe(ticket).await
    }

    /// Run the prober in its own task, bounded by the route timeout plus grace.
    ///
    /// A panicking prober yields `error_exc`; one that overruns is aborted and
    /// reported as `timeout`.
    async fn run_probe(&self, ticket: &ProbeTicket) -> ProbeOutcome {
        let route = ticket.route.clone();
        let limit = route.timeout().saturating_add(self.config.probe_grace);
        let started = Instant::now();

        let prober = Arc::clone(&self.prober);
        let mut handle = tokio::spawn(async move { prober.probe(&route).await });

        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(route_id = %ticket.route.id, error = %e, "Probe task failed");
                ProbeOutcome::failure(
                    FailureKind::ErrorExc,
                    format!("probe failed: {}", e),
                    started.elapsed().as_millis() as u64,
                )
            }
            Err(_) => {
                handle.abort();
                warn!(route_id = %ticket.route.id, "Probe overran its deadline and was aborted");
                ProbeOutcome::failure(
                    FailureKind::Timeout,
                    format!("timeout after {}s", ticket.route.timeout_seconds),
                    started.elapsed().as_millis() as u64,
                )
            }
        }
    }
}

/// Builder for configuring a health monitor
pub struct HealthMonitorBuilder<P: Prober> {
    registry: Option<Arc<Registry>>,
    prober: Option<Arc<P>>,
    policy: HealthPolicy,
    config: SchedulerConfig,
}

impl<P: Prober> HealthMonitorBuilder<P> {
    pub fn new() -> Self {
        Self {
            registry: None,
            prober: None,
            policy: HealthPolicy::default(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn prober(mut self, prober: Arc<P>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn policy(mut self, policy: HealthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Option<Arc<HealthMonitor<P>>> {
        Some(HealthMonitor::new(
            self.registry?,
            self.prober?,
            self.policy,
            self.config,
        ))
    }
}

impl<P: Prober> Default for HealthMonitorBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
