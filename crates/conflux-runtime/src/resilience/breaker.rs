//! Per-target circuit breakers
//!
//! ```text
//!            threshold consecutive failures
//!   Closed ──────────────────────────────────▶ Open
//!     ▲                                        │ cool-down elapsed,
//!     │ probe succeeds                         │ first caller takes the probe
//!     │                                        ▼
//!     └──────────────────────────────────── HalfOpen
//!                  probe fails: back to Open, cool-down restarts
//! ```
//!
//! The table is shared by every run in the process; clones share state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use conflux_core::config::ResilienceSettings;
use conflux_core::{Error, Result};

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls
    pub cool_down: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self::from(&ResilienceSettings::default())
    }
}

impl From<&ResilienceSettings> for BreakerPolicy {
    fn from(settings: &ResilienceSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cool_down: Duration::from_millis(settings.cool_down_ms),
        }
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow
    #[default]
    Closed,
    /// Calls are rejected
    Open,
    /// One probe call is allowed
    HalfOpen,
}

/// A state change of one target's breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Target identity
    pub target: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn move_to(&mut self, target: &str, to: CircuitState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some(Transition {
            target: target.to_string(),
            from,
            to,
        })
    }
}

/// Process-scoped table of breakers keyed by target identity
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Breaker>>>,
}

impl CircuitBreakerRegistry {
    /// Empty table; every target starts closed
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state of a target's breaker
    pub fn state(&self, target: &str) -> CircuitState {
        self.lock()
            .get(target)
            .map(|b| b.state)
            .unwrap_or_default()
    }

    /// Consecutive failures recorded against a target
    pub fn consecutive_failures(&self, target: &str) -> u32 {
        self.lock()
            .get(target)
            .map_or(0, |b| b.consecutive_failures)
    }

    /// Ask to make a call against `target`
    ///
    /// Fails with [`Error::CircuitOpen`] while the breaker is open, or while
    /// another caller holds the half-open probe.
    pub fn acquire(&self, target: &str, policy: &BreakerPolicy) -> Result<Permit> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_string()).or_default();
        let mut transition = None;
        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= policy.cool_down);
                if !cooled {
                    return Err(Error::CircuitOpen {
                        target: target.to_string(),
                    });
                }
                transition = breaker.move_to(target, CircuitState::HalfOpen);
                breaker.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    return Err(Error::CircuitOpen {
                        target: target.to_string(),
                    });
                }
                breaker.probe_in_flight = true;
                true
            }
        };
        Ok(Permit {
            registry: self.clone(),
            target: target.to_string(),
            probe,
            settled: false,
            transition,
        })
    }

    fn succeed(&self, target: &str, probe: bool) -> Option<Transition> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_string()).or_default();
        breaker.consecutive_failures = 0;
        if probe {
            breaker.probe_in_flight = false;
        }
        match breaker.state {
            CircuitState::HalfOpen if probe => {
                breaker.opened_at = None;
                breaker.move_to(target, CircuitState::Closed)
            }
            _ => None,
        }
    }

    fn fail(&self, target: &str, probe: bool, policy: &BreakerPolicy) -> Option<Transition> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_string()).or_default();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        if probe {
            breaker.probe_in_flight = false;
        }
        match breaker.state {
            CircuitState::HalfOpen if probe => {
                breaker.opened_at = Some(Instant::now());
                breaker.move_to(target, CircuitState::Open)
            }
            CircuitState::Closed if breaker.consecutive_failures >= policy.failure_threshold => {
                breaker.opened_at = Some(Instant::now());
                breaker.move_to(target, CircuitState::Open)
            }
            _ => None,
        }
    }

    fn release(&self, target: &str) {
        if let Some(breaker) = self.lock().get_mut(target) {
            breaker.probe_in_flight = false;
        }
    }
}

/// Admission to make one call
///
/// Dropping an unsettled probe permit (a cancelled call, or an outcome that
/// says nothing about the target) hands the probe to the next caller.
#[derive(Debug)]
pub struct Permit {
    registry: CircuitBreakerRegistry,
    target: String,
    probe: bool,
    settled: bool,
    transition: Option<Transition>,
}

impl Permit {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Transition caused by admitting this call (Open to HalfOpen)
    pub fn take_transition(&mut self) -> Option<Transition> {
        self.transition.take()
    }

    /// The call succeeded
    pub fn succeed(mut self) -> Option<Transition> {
        self.settled = true;
        self.registry.succeed(&self.target, self.probe)
    }

    /// The call failed in a way that counts against the target
    pub fn fail(mut self, policy: &BreakerPolicy) -> Option<Transition> {
        self.settled = true;
        self.registry.fail(&self.target, self.probe, policy)
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.registry.release(&self.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 3,
            cool_down: Duration::from_secs(10),
        }
    }

    fn fail_times(registry: &CircuitBreakerRegistry, n: u32) -> Vec<Transition> {
        (0..n)
            .filter_map(|_| registry.acquire("t", &policy()).unwrap().fail(&policy()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let registry = CircuitBreakerRegistry::new();
        assert!(fail_times(&registry, 2).is_empty());
        assert_eq!(registry.state("t"), CircuitState::Closed);

        let transitions = fail_times(&registry, 1);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, CircuitState::Open);

        match registry.acquire("t", &policy()) {
            Err(Error::CircuitOpen { target }) => assert_eq!(target, "t"),
            _ => panic!("Expected CircuitOpen"),
        }
        assert_eq!(registry.state("other"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let registry = CircuitBreakerRegistry::new();
        fail_times(&registry, 2);
        registry.acquire("t", &policy()).unwrap().succeed();
        assert_eq!(registry.consecutive_failures("t"), 0);
        fail_times(&registry, 2);
        assert_eq!(registry.state("t"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_cool_down() {
        let registry = CircuitBreakerRegistry::new();
        fail_times(&registry, 3);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(registry.acquire("t", &policy()).is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let mut probe = registry.acquire("t", &policy()).unwrap();
        assert!(probe.is_probe());
        assert_eq!(
            probe.take_transition().map(|t| t.to),
            Some(CircuitState::HalfOpen)
        );
        // concurrent callers are rejected while the probe is out
        for _ in 0..5 {
            assert!(registry.acquire("t", &policy()).is_err());
        }

        let transition = probe.succeed().unwrap();
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(transition.to, CircuitState::Closed);
        assert!(!registry.acquire("t", &policy()).unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_cool_down() {
        let registry = CircuitBreakerRegistry::new();
        fail_times(&registry, 3);
        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = registry.acquire("t", &policy()).unwrap();
        assert_eq!(
            probe.fail(&policy()).map(|t| t.to),
            Some(CircuitState::Open)
        );

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.acquire("t", &policy()).is_err());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.acquire("t", &policy()).unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_is_released() {
        let registry = CircuitBreakerRegistry::new();
        fail_times(&registry, 3);
        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = registry.acquire("t", &policy()).unwrap();
        drop(probe);
        assert_eq!(registry.state("t"), CircuitState::HalfOpen);
        assert!(registry.acquire("t", &policy()).unwrap().is_probe());
    }
}
