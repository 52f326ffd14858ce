//! Bounded reconnect-and-retry around publish and connect.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};
use yardlink_core::error::{YardError, YardResult};

/// Delay between recovery attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before recovery attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    *max
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Recovery attempts after the first failure.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(3)),
        }
    }
}

/// Result of a supervised publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Dropped because a reconnect was already in flight.
    Suppressed,
}

/// Clears the reconnecting flag on every exit path.
struct ReconnectingGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Wraps publishes and connects with bounded recovery.
#[derive(Debug, Default)]
pub struct ReconnectSupervisor {
    policy: RetryPolicy,
    reconnecting: AtomicBool,
    attempts: AtomicU32,
}

impl ReconnectSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            reconnecting: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Recovery attempts used by the reconnect in flight.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Run `publish`; on a transient failure reconnect and retry it.
    ///
    /// Each recovery attempt sleeps per the backoff, calls `reconnect`, then
    /// re-runs `publish` with the same payload. After `max_attempts` the
    /// counter is reset and [`YardError::AccountConnection`] is returned.
    pub async fn publish<P, PF, R, RF>(
        &self,
        username: &str,
        mut publish: P,
        mut reconnect: R,
    ) -> YardResult<PublishOutcome>
    where
        P: FnMut() -> PF,
        PF: Future<Output = YardResult<()>>,
        R: FnMut() -> RF,
        RF: Future<Output = YardResult<()>>,
    {
        if self.is_reconnecting() {
            tracing::debug!("reconnect in flight, publish suppressed");
            return Ok(PublishOutcome::Suppressed);
        }

        match publish().await {
            Ok(()) => return Ok(PublishOutcome::Published),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => warn!(%username, error = %e, "publish failed, reconnecting"),
        }

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return Ok(PublishOutcome::Suppressed);
        }
        let _guard = ReconnectingGuard(&self.reconnecting);

        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.policy.max_attempts {
                self.attempts.store(0, Ordering::SeqCst);
                error!(%username, attempts = self.policy.max_attempts, "giving up on reconnect");
                return Err(YardError::AccountConnection {
                    username: username.to_string(),
                    attempts: self.policy.max_attempts,
                });
            }

            tokio::time::sleep(self.policy.backoff.delay(attempt)).await;

            if let Err(e) = reconnect().await {
                warn!(%username, attempt, error = %e, "reconnect failed");
                continue;
            }

            match publish().await {
                Ok(()) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    info!(%username, attempt, "publish recovered after reconnect");
                    return Ok(PublishOutcome::Published);
                }
                Err(e) if !e.is_transient() => {
                    self.attempts.store(0, Ordering::SeqCst);
                    return Err(e);
                }
                Err(e) => warn!(%username, attempt, error = %e, "publish failed after reconnect"),
            }
        }
    }

    /// Run `connect`, retrying transient failures per the policy.
    pub async fn connect<F, Fut, T>(&self, username: &str, mut connect: F) -> YardResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = YardResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match connect().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.max_attempts {
                        error!(%username, error = %e, "connect failed after retries");
                        return Err(YardError::AccountConnection {
                            username: username.to_string(),
                            attempts: self.policy.max_attempts,
                        });
                    }
                    let delay = self.policy.backoff.delay(attempt);
                    warn!(
                        %username,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    fn fast() -> ReconnectSupervisor {
        ReconnectSupervisor::new(RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        })
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let b = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(350));
        assert_eq!(b.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.backoff, Backoff::Fixed(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn exhausts_after_three_recoveries() {
        let sup = fast();
        let publishes = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);

        let err = sup
            .publish(
                "agent-7",
                || {
                    publishes.fetch_add(1, Ordering::SeqCst);
                    async { Err(YardError::Transport("down".into())) }
                },
                || {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            YardError::AccountConnection { ref username, attempts: 3 } if username == "agent-7"
        ));
        assert_eq!(publishes.load(Ordering::SeqCst), 4);
        assert_eq!(reconnects.load(Ordering::SeqCst), 3);
        assert_eq!(sup.attempts(), 0);
        assert!(!sup.is_reconnecting());
    }

    #[tokio::test]
    async fn single_failure_retries_same_payload_once() {
        let sup = fast();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let failures = AtomicU32::new(1);
        let payload = "state-1".to_string();

        let outcome = sup
            .publish(
                "agent-7",
                || {
                    sent.lock().unwrap().push(payload.clone());
                    let fail = failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    async move {
                        if fail {
                            Err(YardError::Transport("reset".into()))
                        } else {
                            Ok(())
                        }
                    }
                },
                || async { Ok(()) },
            )
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(*sent.lock().unwrap(), vec!["state-1", "state-1"]);
        assert_eq!(sup.attempts(), 0);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let sup = fast();
        let reconnects = AtomicU32::new(0);
        let err = sup
            .publish(
                "agent-7",
                || async { Err(YardError::Signing("no key".into())) },
                || {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::Signing(_)));
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publishes_during_reconnect_are_suppressed() {
        let sup = fast();
        sup.reconnecting.store(true, Ordering::SeqCst);
        let outcome = sup
            .publish("agent-7", || async { Ok(()) }, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Suppressed);
    }

    #[tokio::test]
    async fn connect_retries_transient_failures() {
        let sup = fast();
        let calls = AtomicU32::new(0);
        let value = sup
            .connect("agent-7", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(YardError::Timeout)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);

        let err = sup
            .connect("agent-7", || async { Err::<(), _>(YardError::Transport("refused".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, YardError::AccountConnection { attempts: 3, .. }));
    }
}
