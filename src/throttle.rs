//! Per-domain sliding-window rate limiting with progressive back-off.
//!
//! A close port of the reference implementation's `ThrottleManager`:
//! no token bucket, no automatic decay — a domain's `delay_seconds` only
//! grows until an administrative [`ThrottleManager::reset`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ThrottleState {
    request_timestamps: VecDeque<Instant>,
    pub total_requests: u64,
    pub violations: u64,
    pub delay_seconds: u64,
    pub last_violation: Option<Instant>,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self {
            request_timestamps: VecDeque::new(),
            total_requests: 0,
            violations: 0,
            delay_seconds: 1,
            last_violation: None,
        }
    }
}

/// A snapshot of a domain's throttle state, serializable for test
/// reproducibility (`ThrottleManager::snapshot`/`restore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleStateSnapshot {
    pub request_count: usize,
    pub total_requests: u64,
    pub violations: u64,
    pub delay_seconds: u64,
}

pub struct ThrottleManager {
    default_limit: u64,
    max_delay: u64,
    domain_limits: HashMap<String, u64>,
    states: Mutex<HashMap<String, ThrottleState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub throttled: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
    pub delay_seconds: u64,
}

impl ThrottleManager {
    pub fn new(default_limit: u64, max_delay: u64, domain_limits: HashMap<String, u64>) -> Self {
        Self { default_limit, max_delay, domain_limits, states: Mutex::new(HashMap::new()) }
    }

    pub fn limit_for(&self, domain: &str) -> u64 {
        self.domain_limits.get(domain).copied().unwrap_or(self.default_limit)
    }

    /// Appends `now` to the domain's window, pruning stale timestamps, and
    /// bumps `total_requests`. Called exactly once per forwarded upstream
    /// call — never on a cache hit.
    pub fn record_request(&self, domain: &str) {
        let now = Instant::now();
        let mut states = self.states.lock().expect("throttle mutex poisoned");
        let state = states.entry(domain.to_string()).or_default();
        state.request_timestamps.push_back(now);
        prune(&mut state.request_timestamps, now);
        state.total_requests += 1;
    }

    /// Decides whether `domain` should be throttled right now, applying
    /// progressive back-off on a fresh violation.
    pub fn should_throttle(&self, domain: &str) -> ThrottleDecision {
        let now = Instant::now();
        let limit = self.limit_for(domain);
        let mut states = self.states.lock().expect("throttle mutex poisoned");
        let state = states.entry(domain.to_string()).or_default();
        prune(&mut state.request_timestamps, now);

        let count = state.request_timestamps.len() as u64;
        let oldest_age = state
            .request_timestamps
            .front()
            .map(|t| now.duration_since(*t).as_secs())
            .unwrap_or(0);
        let reset_seconds = if state.request_timestamps.is_empty() {
            1
        } else {
            WINDOW.as_secs().saturating_sub(oldest_age).max(1)
        };

        let throttled = if count > limit {
            state.violations += 1;
            state.last_violation = Some(now);
            state.delay_seconds = if state.delay_seconds == 1 {
                2.min(self.max_delay)
            } else {
                (state.delay_seconds * 2).min(self.max_delay)
            };
            true
        } else if state.delay_seconds > 1 {
            match state.last_violation {
                Some(last) => now.duration_since(last).as_secs() < state.delay_seconds,
                None => false,
            }
        } else {
            false
        };

        ThrottleDecision {
            throttled,
            limit,
            remaining: limit.saturating_sub(count),
            reset_seconds,
            delay_seconds: state.delay_seconds,
        }
    }

    pub fn delay_for(&self, domain: &str) -> u64 {
        self.states
            .lock()
            .expect("throttle mutex poisoned")
            .get(domain)
            .map(|s| s.delay_seconds)
            .unwrap_or(1)
    }

    /// Clears a domain's violation history and back-off delay. The only
    /// way `delay_seconds` ever returns to 1 short of a process restart.
    pub fn reset(&self, domain: &str) {
        self.states.lock().expect("throttle mutex poisoned").remove(domain);
    }

    pub fn snapshot(&self) -> HashMap<String, ThrottleStateSnapshot> {
        self.states
            .lock()
            .expect("throttle mutex poisoned")
            .iter()
            .map(|(domain, state)| {
                (
                    domain.clone(),
                    ThrottleStateSnapshot {
                        request_count: state.request_timestamps.len(),
                        total_requests: state.total_requests,
                        violations: state.violations,
                        delay_seconds: state.delay_seconds,
                    },
                )
            })
            .collect()
    }

    pub fn restore(&self, snapshot: HashMap<String, ThrottleStateSnapshot>) {
        let mut states = self.states.lock().expect("throttle mutex poisoned");
        states.clear();
        let now = Instant::now();
        for (domain, snap) in snapshot {
            let mut state = ThrottleState {
                total_requests: snap.total_requests,
                violations: snap.violations,
                delay_seconds: snap.delay_seconds,
                last_violation: if snap.violations > 0 { Some(now) } else { None },
                ..Default::default()
            };
            for _ in 0..snap.request_count {
                state.request_timestamps.push_back(now);
            }
            states.insert(domain, state);
        }
    }

    pub fn domain_request_counts(&self) -> HashMap<String, u64> {
        self.states
            .lock()
            .expect("throttle mutex poisoned")
            .iter()
            .map(|(d, s)| (d.clone(), s.total_requests))
            .collect()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = timestamps.front() {
        if now.duration_since(*front) > WINDOW {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_count_equal_to_limit_does_not_throttle() {
        let manager = ThrottleManager::new(3, 300, HashMap::new());
        for _ in 0..3 {
            manager.record_request("d");
        }
        assert!(!manager.should_throttle("d").throttled);
    }

    #[test]
    fn request_count_above_limit_throttles() {
        let manager = ThrottleManager::new(3, 300, HashMap::new());
        for _ in 0..4 {
            manager.record_request("d");
        }
        assert!(manager.should_throttle("d").throttled);
    }

    #[test]
    fn back_off_doubles_per_violation_up_to_max() {
        let manager = ThrottleManager::new(1, 8, HashMap::new());
        manager.record_request("d");
        manager.record_request("d"); // 2 requests > limit of 1
        let mut delays = Vec::new();
        for _ in 0..5 {
            manager.record_request("d");
            let decision = manager.should_throttle("d");
            delays.push(decision.delay_seconds);
        }
        assert_eq!(delays, vec![2, 4, 8, 8, 8]);
    }

    #[test]
    fn reset_clears_delay_and_violations() {
        let manager = ThrottleManager::new(1, 300, HashMap::new());
        manager.record_request("d");
        manager.record_request("d");
        manager.should_throttle("d");
        assert!(manager.delay_for("d") > 1);
        manager.reset("d");
        assert_eq!(manager.delay_for("d"), 1);
    }

    #[test]
    fn snapshot_and_restore_round_trip_counters() {
        let manager = ThrottleManager::new(5, 300, HashMap::new());
        manager.record_request("d");
        manager.record_request("d");
        let snapshot = manager.snapshot();

        let restored = ThrottleManager::new(5, 300, HashMap::new());
        restored.restore(snapshot);
        assert_eq!(restored.domain_request_counts()["d"], 2);
    }
}
