//! Resilience layer
//!
//! Every call that leaves the process goes through [`Resilience::execute`],
//! which applies, from outermost to innermost:
//!
//! 1. **Retry** - transient failures are retried with exponential backoff
//! 2. **Circuit breaker** - an open breaker rejects the attempt without I/O
//! 3. **Timeout** - each attempt is bounded
//!
//! Policies come from the `resilience` section of `conflux.yaml`, with
//! per-target overrides:
//!
//! ```yaml
//! resilience:
//!   maxAttempts: 3
//!   timeoutMs: 30000
//!   targets:
//!     "Database:postgresql:postgres://db/shop":
//!       failureThreshold: 2
//! ```

pub mod breaker;
pub mod retry;
pub mod timeout;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conflux_core::config::ResilienceSettings;
use conflux_core::{Error, Result};

pub use breaker::{BreakerPolicy, CircuitBreakerRegistry, CircuitState, Transition};
pub use retry::RetryPolicy;

use crate::telemetry::{EventKind, EventScope, SharedSink, TracingSink};

/// Retry, breaker and timeout settings for one target
#[derive(Debug, Clone, PartialEq)]
pub struct ResiliencePolicy {
    /// Retry settings
    pub retry: RetryPolicy,
    /// Breaker settings
    pub breaker: BreakerPolicy,
    /// Per-attempt bound
    pub timeout: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::from(&ResilienceSettings::default())
    }
}

impl From<&ResilienceSettings> for ResiliencePolicy {
    fn from(settings: &ResilienceSettings) -> Self {
        Self {
            retry: RetryPolicy::from(settings),
            breaker: BreakerPolicy::from(settings),
            timeout: Duration::from_millis(settings.timeout_ms.max(1)),
        }
    }
}

/// A successful call and the attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    /// Result of the successful attempt
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Applies resilience policies to outbound calls
#[derive(Clone)]
pub struct Resilience {
    settings: Arc<ResilienceSettings>,
    breakers: CircuitBreakerRegistry,
    telemetry: SharedSink,
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("settings", &self.settings)
            .field("breakers", &self.breakers)
            .finish()
    }
}

impl Default for Resilience {
    fn default() -> Self {
        Self::new(
            ResilienceSettings::default(),
            CircuitBreakerRegistry::new(),
            Arc::new(TracingSink),
        )
    }
}

impl Resilience {
    /// Create a layer over a shared breaker table
    pub fn new(
        settings: ResilienceSettings,
        breakers: CircuitBreakerRegistry,
        telemetry: SharedSink,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            breakers,
            telemetry,
        }
    }

    /// Policy in force for `target`
    pub fn policy_for(&self, target: &str) -> ResiliencePolicy {
        ResiliencePolicy::from(&self.settings.for_target(target))
    }

    /// The shared breaker table
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// The telemetry sink events go to
    pub fn telemetry(&self) -> &SharedSink {
        &self.telemetry
    }

    fn report(&self, scope: &EventScope, transition: Option<Transition>) {
        if let Some(t) = transition {
            tracing::warn!(
                endpoint = %t.target,
                from = ?t.from,
                to = ?t.to,
                "circuit breaker state changed"
            );
            self.telemetry.emit(
                scope
                    .event(EventKind::BreakerStateChanged)
                    .with("target", t.target)
                    .with("from", format!("{:?}", t.from))
                    .with("to", format!("{:?}", t.to)),
            );
        }
    }

    /// Run `call` against `target` under the target's policy
    ///
    /// `call` is invoked once per attempt. Non-transient errors are returned
    /// immediately; transient ones are retried until attempts run out, and
    /// the last error is returned.
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &EventScope,
        target: &str,
        call: F,
    ) -> Result<Attempted<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.attempt(scope, target, call, true).await
    }

    /// Like [`execute`](Self::execute), without the per-attempt timeout
    ///
    /// For calls that apply [`ResiliencePolicy::timeout`] to each wait
    /// themselves, such as a stream read bounded per item.
    pub async fn execute_paced<T, F, Fut>(
        &self,
        scope: &EventScope,
        target: &str,
        call: F,
    ) -> Result<Attempted<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.attempt(scope, target, call, false).await
    }

    async fn attempt<T, F, Fut>(
        &self,
        scope: &EventScope,
        target: &str,
        mut call: F,
        bounded: bool,
    ) -> Result<Attempted<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy_for(target);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.telemetry.emit(
                scope
                    .event(EventKind::AttemptStarted)
                    .with("target", target)
                    .with("attempt", attempt),
            );

            let outcome = match self.breakers.acquire(target, &policy.breaker) {
                Err(rejected) => Err(rejected),
                Ok(mut permit) => {
                    self.report(scope, permit.take_transition());
                    let outcome = if bounded {
                        timeout::bounded(target, policy.timeout, call()).await
                    } else {
                        call().await
                    };
                    match &outcome {
                        Ok(_) => self.report(scope, permit.succeed()),
                        Err(e) if e.counts_as_target_failure() => {
                            self.report(scope, permit.fail(&policy.breaker))
                        }
                        // says nothing about the target's health
                        Err(_) => drop(permit),
                    }
                    outcome
                }
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(endpoint = target, attempt, "call succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            self.telemetry.emit(
                scope
                    .event(EventKind::AttemptFailed)
                    .with("target", target)
                    .with("attempt", attempt)
                    .with("error", error.to_string())
                    .with("transient", error.is_transient()),
            );

            if matches!(error, Error::Cancelled)
                || !error.is_transient()
                || !policy.retry.allows_another(attempt)
            {
                if error.is_transient() {
                    tracing::warn!(
                        endpoint = target,
                        attempts = attempt,
                        error = %error,
                        "retries exhausted"
                    );
                }
                return Err(error);
            }

            let delay = policy.retry.delay(attempt);
            tracing::warn!(
                endpoint = target,
                attempt,
                max_attempts = policy.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after transient failure"
            );
            self.telemetry.emit(
                scope
                    .event(EventKind::RetryScheduled)
                    .with("target", target)
                    .with("attempt", attempt)
                    .with("delayMs", delay.as_millis() as u64),
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingSink;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(max_attempts: u32, failure_threshold: u32) -> ResilienceSettings {
        ResilienceSettings {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: 0.0,
            timeout_ms: 500,
            failure_threshold,
            cool_down_ms: 5000,
            targets: BTreeMap::new(),
        }
    }

    fn layer(settings: ResilienceSettings) -> (Resilience, CollectingSink) {
        let sink = CollectingSink::new();
        let layer = Resilience::new(settings, CircuitBreakerRegistry::new(), Arc::new(sink.clone()));
        (layer, sink)
    }

    fn scope() -> EventScope {
        EventScope::run("run")
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_allowed_attempt() {
        let (layer, sink) = layer(settings(4, 10));
        let calls = AtomicU32::new(0);

        let attempted = layer
            .execute(&scope(), "t", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(Error::connection("t", "reset"))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(attempted.attempts, 4);
        assert_eq!(attempted.value, 4);
        assert_eq!(sink.of_kind(EventKind::RetryScheduled).len(), 3);
        assert_eq!(sink.of_kind(EventKind::AttemptFailed).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_attempts() {
        let (layer, _) = layer(settings(3, 10));
        let calls = AtomicU32::new(0);

        let err = layer
            .execute(&scope(), "t", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::connection("t", "reset"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_is_not_retried() {
        let (layer, _) = layer(settings(5, 10));
        let calls = AtomicU32::new(0);

        let err = layer
            .execute(&scope(), "t", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Remote {
                    target: "t".to_string(),
                    status: 404,
                    message: "not found".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Remote { status: 404, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(layer.breakers().consecutive_failures("t"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_between_attempts() {
        let (layer, _) = layer(settings(3, 10));
        let start = tokio::time::Instant::now();
        let _ = layer
            .execute(&scope(), "t", || async {
                Err::<(), _>(Error::connection("t", "reset"))
            })
            .await;
        // 100ms + 200ms
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let (layer, _) = layer(settings(2, 10));
        let calls = AtomicU32::new(0);
        let err = layer
            .execute(&scope(), "t", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { after_ms: 500, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(layer.breakers().consecutive_failures("t"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_call_outlives_attempt_timeout() {
        let (layer, _) = layer(settings(2, 10));
        let attempted = layer
            .execute_paced(&scope(), "t", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(attempted.value, 7);
        assert_eq!(attempted.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_without_io() {
        let (layer, sink) = layer(settings(1, 3));
        let calls = AtomicU32::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::connection("t", "refused"))
        };

        for _ in 0..3 {
            let _ = layer.execute(&scope(), "t", failing).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(layer.breakers().state("t"), CircuitState::Open);

        let err = layer.execute(&scope(), "t", failing).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.of_kind(EventKind::BreakerStateChanged).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_probe_among_concurrent_callers() {
        let (layer, _) = layer(settings(1, 1));
        let _ = layer
            .execute(&scope(), "t", || async {
                Err::<(), _>(Error::connection("t", "refused"))
            })
            .await;
        tokio::time::advance(Duration::from_millis(5000)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let layer = layer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                layer
                    .execute(&scope(), "t", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        }
                    })
                    .await
            }));
        }

        let mut succeeded = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::CircuitOpen { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(succeeded, 1);
        assert_eq!(rejected, 7);
        assert_eq!(layer.breakers().state("t"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_retries_do_not_extend_window() {
        let (layer, _) = layer(settings(1, 1));
        let _ = layer
            .execute(&scope(), "t", || async {
                Err::<(), _>(Error::connection("t", "refused"))
            })
            .await;

        let retrying = Resilience::new(
            settings(4, 1),
            layer.breakers().clone(),
            Arc::new(crate::telemetry::NoopSink),
        );
        let err = retrying
            .execute(&scope(), "t", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(layer.breakers().consecutive_failures("t"), 1);

        // retries took 100 + 200 + 400ms; the original window still applies
        tokio::time::advance(Duration::from_millis(5000 - 700)).await;
        assert!(
            retrying
                .execute(&scope(), "t", || async { Ok(()) })
                .await
                .is_ok()
        );
    }

    #[test]
    fn test_target_overrides() {
        let mut s = settings(3, 5);
        s.targets.insert(
            "special".to_string(),
            conflux_core::config::ResilienceOverrides {
                max_attempts: Some(7),
                timeout_ms: Some(50),
                ..Default::default()
            },
        );
        let (layer, _) = layer(s);
        let policy = layer.policy_for("special");
        assert_eq!(policy.retry.max_attempts, 7);
        assert_eq!(policy.timeout, Duration::from_millis(50));
        assert_eq!(layer.policy_for("plain").retry.max_attempts, 3);
    }
}
