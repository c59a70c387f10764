// Reconnect wait calculation. The wait starts at the policy's initial
// value, doubles on every disconnect and never exceeds the ceiling.

use std::time::Duration;

use crate::config::StreamSettings;

/// When the wait goes back to the initial value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffReset {
    /// Only a new consumer starts from the initial wait again.
    Never,
    /// Reset after a connection that stayed up at least this long.
    AfterStable(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
    pub reset: BackoffReset,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&StreamSettings::default())
    }
}

impl From<&StreamSettings> for BackoffPolicy {
    fn from(settings: &StreamSettings) -> Self {
        BackoffPolicy {
            initial: settings.backoff_initial,
            ceiling: settings.backoff_max,
            reset: match settings.backoff_reset_after {
                Some(after) => BackoffReset::AfterStable(after),
                None => BackoffReset::Never,
            },
        }
    }
}

/// Exponential reconnect wait: `min(initial * 2^n, ceiling)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Backoff {
            current: policy.initial.min(policy.ceiling),
            policy,
        }
    }

    /// The wait the next disconnect will use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the wait for this disconnect and double the next one.
    ///
    /// `hint` is a server-provided minimum (rate-limit reset); it can raise
    /// the wait but never past the ceiling.
    pub fn next_wait(&mut self, hint: Option<Duration>) -> Duration {
        let wait = self
            .current
            .max(hint.unwrap_or(Duration::ZERO))
            .min(self.policy.ceiling);
        self.current = self.current.saturating_mul(2).min(self.policy.ceiling);
        wait
    }

    /// Report how long the connection that just dropped was up.
    pub fn connection_lasted(&mut self, uptime: Duration) {
        if let BackoffReset::AfterStable(threshold) = self.policy.reset {
            if uptime >= threshold && self.current != self.policy.initial {
                tracing::debug!(?uptime, "connection was stable, resetting backoff");
                self.current = self.policy.initial.min(self.policy.ceiling);
            }
        }
    }
}
