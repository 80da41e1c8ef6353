//! Route health state machine
//!
//! Probe outcomes are folded into a [`HealthRecord`] by [`advance`], a pure
//! function that applies the degraded-latency threshold and failure debounce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally visible health of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    /// Not probed yet
    #[default]
    Unknown,
    /// Responding within the latency threshold
    Up,
    /// Responding, but slower than the latency threshold
    Degraded,
    /// Failing
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "UNKNOWN",
            HealthState::Up => "UP",
            HealthState::Degraded => "DEGRADED",
            HealthState::Down => "DOWN",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a probe failed, in classification priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "offline_dns")]
    OfflineDns,
    #[serde(rename = "offline_conn")]
    OfflineConn,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "error_5xx")]
    Error5xx,
    #[serde(rename = "error_exc")]
    ErrorExc,
    #[serde(rename = "misconfig")]
    Misconfig,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::OfflineDns => "offline_dns",
            FailureKind::OfflineConn => "offline_conn",
            FailureKind::Timeout => "timeout",
            FailureKind::Error5xx => "error_5xx",
            FailureKind::ErrorExc => "error_exc",
            FailureKind::Misconfig => "misconfig",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub success: bool,
    pub http_status: Option<u16>,
    pub duration_ms: u64,
    pub failure_kind: Option<FailureKind>,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn success(http_status: u16, duration_ms: u64) -> Self {
        Self {
            success: true,
            http_status: Some(http_status),
            duration_ms,
            failure_kind: None,
            detail: format!("HTTP {} in {} ms", http_status, duration_ms),
        }
    }

    pub fn failure(kind: FailureKind, detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            http_status: None,
            duration_ms,
            failure_kind: Some(kind),
            detail: detail.into(),
        }
    }

    /// Classify a received HTTP status code
    pub fn from_status(http_status: u16, duration_ms: u64) -> Self {
        match http_status {
            100..=499 => Self::success(http_status, duration_ms),
            500..=599 => Self {
                http_status: Some(http_status),
                ..Self::failure(
                    FailureKind::Error5xx,
                    format!("HTTP {}", http_status),
                    duration_ms,
                )
            },
            _ => Self {
                http_status: Some(http_status),
                ..Self::failure(
                    FailureKind::ErrorExc,
                    format!("unexpected HTTP status {}", http_status),
                    duration_ms,
                )
            },
        }
    }
}

/// Thresholds applied by the state machine
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Successful responses slower than this are DEGRADED
    pub degraded_threshold_ms: u64,
    /// Consecutive failures needed before an established state turns DOWN
    pub failure_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_threshold_ms: 3000,
            failure_threshold: 1,
        }
    }
}

/// Health bookkeeping for one route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub state: HealthState,
    /// Set only while `state` is DOWN
    pub reason: Option<FailureKind>,
    pub http_status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl HealthRecord {
    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Fold a probe outcome into the previous record.
///
/// Diagnostic fields are refreshed on every call; `state` only moves to DOWN
/// once `failure_threshold` consecutive failures have been seen. A route that
/// has never been classified has no state to hold, so its first failure
/// resolves to DOWN immediately.
pub fn advance(
    prev: &HealthRecord,
    outcome: &ProbeOutcome,
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> HealthRecord {
    let mut next = HealthRecord {
        http_status: outcome.http_status,
        duration_ms: Some(outcome.duration_ms),
        last_error: (!outcome.success).then(|| outcome.detail.clone()),
        last_checked_at: Some(now),
        ..prev.clone()
    };

    if outcome.success {
        next.consecutive_failures = 0;
        next.consecutive_successes = prev.consecutive_successes.saturating_add(1);
        next.reason = None;
        next.state = if outcome.duration_ms > policy.degraded_threshold_ms {
            HealthState::Degraded
        } else {
            HealthState::Up
        };
        return next;
    }

    next.consecutive_successes = 0;
    next.consecutive_failures = prev.consecutive_failures.saturating_add(1);

    if prev.state == HealthState::Unknown
        || next.consecutive_failures >= policy.failure_threshold.max(1)
    {
        next.state = HealthState::Down;
        next.reason = Some(outcome.failure_kind.unwrap_or(FailureKind::ErrorExc));
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32) -> HealthPolicy {
        HealthPolicy {
            degraded_threshold_ms: 3000,
            failure_threshold: threshold,
        }
    }

    fn up_record() -> HealthRecord {
        advance(
            &HealthRecord::unknown(),
            &ProbeOutcome::success(200, 50),
            &policy(1),
            Utc::now(),
        )
    }

    #[test]
    fn test_default_policy() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.degraded_threshold_ms, 3000);
        assert_eq!(policy.failure_threshold, 1);
    }

    #[test]
    fn test_fast_success_is_up() {
        let record = up_record();
        assert_eq!(record.state, HealthState::Up);
        assert_eq!(record.reason, None);
        assert_eq!(record.http_status, Some(200));
        assert_eq!(record.duration_ms, Some(50));
        assert_eq!(record.consecutive_successes, 1);
        assert!(record.last_checked_at.is_some());
    }

    #[test]
    fn test_slow_success_is_degraded() {
        let record = advance(
            &HealthRecord::unknown(),
            &ProbeOutcome::success(200, 4000),
            &policy(1),
            Utc::now(),
        );
        assert_eq!(record.state, HealthState::Degraded);
        assert_eq!(record.reason, None);
    }

    #[test]
    fn test_threshold_boundary_is_up() {
        let record = advance(
            &HealthRecord::unknown(),
            &ProbeOutcome::success(204, 3000),
            &policy(1),
            Utc::now(),
        );
        assert_eq!(record.state, HealthState::Up);
    }

    #[test]
    fn test_failure_with_default_threshold_is_immediate() {
        let outcome = ProbeOutcome::from_status(503, 12);
        let record = advance(&up_record(), &outcome, &policy(1), Utc::now());
        assert_eq!(record.state, HealthState::Down);
        assert_eq!(record.reason, Some(FailureKind::Error5xx));
        assert_eq!(record.http_status, Some(503));
        assert_eq!(record.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.consecutive_successes, 0);
    }

    #[test]
    fn test_hysteresis_holds_state_below_threshold() {
        let policy = policy(3);
        let mut record = up_record();

        for i in 1..3 {
            let outcome = ProbeOutcome::failure(FailureKind::Timeout, "timeout after 3s", 3000);
            record = advance(&record, &outcome, &policy, Utc::now());
            assert_eq!(record.state, HealthState::Up);
            assert_eq!(record.reason, None);
            assert_eq!(record.consecutive_failures, i);
            assert_eq!(record.last_error.as_deref(), Some("timeout after 3s"));
        }

        record = advance(&record, &ProbeOutcome::success(200, 20), &policy, Utc::now());
        assert_eq!(record.state, HealthState::Up);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn test_threshold_reached_goes_down() {
        let policy = policy(2);
        let outcome = ProbeOutcome::failure(FailureKind::OfflineConn, "TCP connect failed", 1);

        let record = advance(&up_record(), &outcome, &policy, Utc::now());
        assert_eq!(record.state, HealthState::Up);

        let record = advance(&record, &outcome, &policy, Utc::now());
        assert_eq!(record.state, HealthState::Down);
        assert_eq!(record.reason, Some(FailureKind::OfflineConn));
    }

    #[test]
    fn test_unknown_resolves_on_first_failure() {
        let outcome = ProbeOutcome::failure(FailureKind::OfflineDns, "DNS error", 3);
        let record = advance(&HealthRecord::unknown(), &outcome, &policy(5), Utc::now());
        assert_eq!(record.state, HealthState::Down);
        assert_eq!(record.reason, Some(FailureKind::OfflineDns));
    }

    #[test]
    fn test_reason_follows_latest_failure_while_down() {
        let policy = policy(1);
        let dns = ProbeOutcome::failure(FailureKind::OfflineDns, "DNS error", 3);
        let conn = ProbeOutcome::failure(FailureKind::OfflineConn, "TCP connect failed", 3);

        let record = advance(&up_record(), &dns, &policy, Utc::now());
        let record = advance(&record, &conn, &policy, Utc::now());
        assert_eq!(record.reason, Some(FailureKind::OfflineConn));
        assert_eq!(record.consecutive_failures, 2);
    }

    #[test]
    fn test_recovery_clears_reason() {
        let down = advance(
            &up_record(),
            &ProbeOutcome::failure(FailureKind::ErrorExc, "boom", 1),
            &policy(1),
            Utc::now(),
        );
        let record = advance(&down, &ProbeOutcome::success(200, 10), &policy(1), Utc::now());
        assert_eq!(record.state, HealthState::Up);
        assert_eq!(record.reason, None);
    }

    #[test]
    fn test_status_classification() {
        assert!(ProbeOutcome::from_status(200, 1).success);
        assert!(ProbeOutcome::from_status(302, 1).success);
        assert!(ProbeOutcome::from_status(401, 1).success);
        assert!(ProbeOutcome::from_status(404, 1).success);

        let outcome = ProbeOutcome::from_status(599, 1);
        assert!(!outcome.success);
        assert_eq!(outcome.failure_kind, Some(FailureKind::Error5xx));
        assert_eq!(outcome.http_status, Some(599));

        let outcome = ProbeOutcome::from_status(600, 1);
        assert_eq!(outcome.failure_kind, Some(FailureKind::ErrorExc));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&FailureKind::Error5xx).unwrap(),
            "\"error_5xx\""
        );
        assert_eq!(
            serde_json::to_string(&HealthState::Degraded).unwrap(),
            "\"DEGRADED\""
        );
        assert_eq!(FailureKind::OfflineDns.to_string(), "offline_dns");
    }
}
