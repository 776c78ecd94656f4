use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::models::error_type::ErrorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

/// Admin view of one access key's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub access_key_id: Uuid,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Per-access-key breaker guarding the Plan upstream.
///
/// Only `CIRCUIT_TRIGGERS` failures count. `threshold` of them inside
/// `failure_window` open the circuit for `reset_timeout`; the first call after
/// that is a half-open probe.
pub struct CircuitBreaker {
    entries: DashMap<Uuid, BreakerEntry>,
    threshold: u32,
    failure_window: Duration,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, failure_window: std::time::Duration, reset_timeout: std::time::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            threshold: threshold.max(1),
            failure_window: Duration::milliseconds(failure_window.as_millis() as i64),
            reset_timeout: Duration::milliseconds(reset_timeout.as_millis() as i64),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            config.circuit_failure_window,
            config.circuit_reset_timeout,
        )
    }

    pub fn is_open(&self, key: Uuid) -> bool {
        self.is_open_at(key, Utc::now())
    }

    pub fn record_success(&self, key: Uuid) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.failure_count = 0;
            if entry.state == CircuitState::HalfOpen {
                entry.state = CircuitState::Closed;
                entry.opened_at = None;
                tracing::info!(access_key_id = %key, "circuit breaker CLOSED: plan probe succeeded");
            }
        }
    }

    pub fn record_failure(&self, key: Uuid, error_type: ErrorType) {
        self.record_failure_at(key, error_type, Utc::now())
    }

    pub fn state(&self, key: Uuid) -> CircuitState {
        self.entries
            .get(&key)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .entries
            .iter()
            .map(|e| CircuitSnapshot {
                access_key_id: *e.key(),
                state: e.state,
                failure_count: e.failure_count,
                last_failure_at: e.last_failure_at,
                opened_at: e.opened_at,
            })
            .collect();
        out.sort_by_key(|s| s.access_key_id);
        out
    }

    fn is_open_at(&self, key: Uuid, now: DateTime<Utc>) -> bool {
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.state != CircuitState::Open {
            return false;
        }
        match entry.opened_at {
            Some(opened) if now <= opened + self.reset_timeout => true,
            _ => {
                entry.state = CircuitState::HalfOpen;
                tracing::info!(access_key_id = %key, "circuit breaker HALF-OPEN: allowing plan probe");
                false
            }
        }
    }

    fn record_failure_at(&self, key: Uuid, error_type: ErrorType, now: DateTime<Utc>) {
        if !error_type.trips_circuit() {
            return;
        }

        let mut entry = self.entries.entry(key).or_default();
        if let Some(last) = entry.last_failure_at {
            if now - last > self.failure_window {
                entry.failure_count = 0;
            }
        }
        entry.failure_count += 1;
        entry.last_failure_at = Some(now);

        let reopen = entry.state == CircuitState::HalfOpen;
        if reopen || (entry.state == CircuitState::Closed && entry.failure_count >= self.threshold) {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(now);
            tracing::warn!(
                access_key_id = %key,
                failures = entry.failure_count,
                error_type = %error_type,
                half_open_probe = reopen,
                "circuit breaker OPENED: plan upstream skipped"
            );
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, StdDuration::from_secs(60), StdDuration::from_secs(1800))
    }

    #[test]
    fn test_opens_after_threshold_triggers() {
        let cb = breaker();
        let key = Uuid::new_v4();
        let t0 = Utc::now();

        cb.record_failure_at(key, ErrorType::RateLimit, t0);
        cb.record_failure_at(key, ErrorType::ServerError, t0 + Duration::seconds(1));
        assert!(!cb.is_open_at(key, t0 + Duration::seconds(2)));

        cb.record_failure_at(key, ErrorType::RateLimit, t0 + Duration::seconds(2));
        assert!(cb.is_open_at(key, t0 + Duration::seconds(3)));
        assert_eq!(cb.state(key), CircuitState::Open);
    }

    #[test]
    fn test_non_trigger_errors_ignored() {
        let cb = breaker();
        let key = Uuid::new_v4();
        for _ in 0..10 {
            cb.record_failure(key, ErrorType::Timeout);
            cb.record_failure(key, ErrorType::UsageLimit);
            cb.record_failure(key, ErrorType::ClientError);
        }
        assert!(!cb.is_open(key));
        assert!(cb.snapshot().is_empty());
    }

    #[test]
    fn test_window_resets_count() {
        let cb = breaker();
        let key = Uuid::new_v4();
        let t0 = Utc::now();
        cb.record_failure_at(key, ErrorType::RateLimit, t0);
        cb.record_failure_at(key, ErrorType::RateLimit, t0 + Duration::seconds(10));
        // Third failure lands after the window: count restarts at 1.
        cb.record_failure_at(key, ErrorType::RateLimit, t0 + Duration::seconds(100));
        assert!(!cb.is_open_at(key, t0 + Duration::seconds(101)));
        assert_eq!(cb.snapshot()[0].failure_count, 1);
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let cb = breaker();
        let key = Uuid::new_v4();
        let t0 = Utc::now();
        for i in 0..3 {
            cb.record_failure_at(key, ErrorType::ServerError, t0 + Duration::seconds(i));
        }
        assert!(cb.is_open_at(key, t0 + Duration::seconds(1800)));

        // Cooldown elapsed.
        assert!(!cb.is_open_at(key, t0 + Duration::seconds(1803)));
        assert_eq!(cb.state(key), CircuitState::HalfOpen);

        cb.record_success(key);
        assert_eq!(cb.state(key), CircuitState::Closed);
        assert!(cb.snapshot()[0].opened_at.is_none());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker();
        let key = Uuid::new_v4();
        let t0 = Utc::now();
        for _ in 0..3 {
            cb.record_failure_at(key, ErrorType::RateLimit, t0);
        }
        let probe_at = t0 + Duration::seconds(2000);
        assert!(!cb.is_open_at(key, probe_at));

        cb.record_failure_at(key, ErrorType::RateLimit, probe_at);
        assert_eq!(cb.state(key), CircuitState::Open);
        assert!(cb.is_open_at(key, probe_at + Duration::seconds(1)));
    }

    #[test]
    fn test_keys_are_independent() {
        let cb = breaker();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..3 {
            cb.record_failure(a, ErrorType::RateLimit);
        }
        assert!(cb.is_open(a));
        assert!(!cb.is_open(b));
    }
}
