//! Read-side views handed to callers: route snapshots, aggregate counts and
//! manual test reports.

use crate::health::{FailureKind, HealthPolicy, HealthRecord, HealthState, ProbeOutcome};
use crate::route::Route;
use serde::Serialize;

/// A route and its health, copied together under the route's lock
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteView {
    #[serde(flatten)]
    pub route: Route,
    #[serde(flatten)]
    pub health: HealthRecord,
}

impl RouteView {
    pub fn new(route: Route, health: HealthRecord) -> Self {
        Self { route, health }
    }

    pub fn id(&self) -> &str {
        &self.route.id
    }

    pub fn state(&self) -> HealthState {
        self.health.state
    }
}

/// Aggregate counts computed from one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    pub total: usize,
    pub enabled: usize,
    pub up: usize,
    pub degraded: usize,
    pub down: usize,
    pub unknown: usize,
}

impl RouteStats {
    pub fn from_views(views: &[RouteView]) -> Self {
        views.iter().fold(Self::default(), |mut stats, view| {
            stats.total += 1;
            if view.route.enabled {
                stats.enabled += 1;
            }
            match view.health.state {
                HealthState::Up => stats.up += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Down => stats.down += 1,
                HealthState::Unknown => stats.unknown += 1,
            }
            stats
        })
    }
}

/// Immediate result of a manual "test now" request.
///
/// Reflects the raw probe outcome; `state` and `reason` are the stored record
/// after the outcome was applied, absent if the route vanished mid-probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    pub success: bool,
    /// Console status label: online, slow, timeout, offline or error
    pub status: &'static str,
    pub status_code: Option<u16>,
    pub response_time: u64,
    pub error: Option<String>,
    pub state: Option<HealthState>,
    pub reason: Option<FailureKind>,
}

impl TestReport {
    pub fn new(outcome: &ProbeOutcome, policy: &HealthPolicy, record: Option<&HealthRecord>) -> Self {
        Self {
            success: outcome.success,
            status: status_label(outcome, policy),
            status_code: outcome.http_status,
            response_time: outcome.duration_ms,
            error: (!outcome.success).then(|| outcome.detail.clone()),
            state: record.map(|r| r.state),
            reason: record.and_then(|r| r.reason),
        }
    }
}

fn status_label(outcome: &ProbeOutcome, policy: &HealthPolicy) -> &'static str {
    match outcome.failure_kind {
        None if outcome.duration_ms > policy.degraded_threshold_ms => "slow",
        None => "online",
        Some(FailureKind::Timeout) => "timeout",
        Some(FailureKind::OfflineDns | FailureKind::OfflineConn) => "offline",
        Some(_) => "error",
    }
}
