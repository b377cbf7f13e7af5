//! Retry delay policies.
//!
//! One strategy shared by all failure families; each family gets its own
//! parameters. Delays never decrease as the attempt count grows and never
//! exceed the cap.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Which retry family a delay is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryFamily {
    Qualification,
    Dispatch,
    Workspace,
}

impl std::fmt::Display for RetryFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Qualification => "qualification",
            Self::Dispatch => "dispatch",
            Self::Workspace => "workspace",
        };
        write!(f, "{s}")
    }
}

/// Delay schedule: explicit leading steps, then multiplied growth up to a cap.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    steps: Vec<Duration>,
    multiplier: f64,
    cap: Duration,
}

impl BackoffPolicy {
    /// Build a policy. Steps are made non-decreasing and the multiplier is
    /// clamped to at least 1.0.
    pub fn new(steps: Vec<Duration>, multiplier: f64, cap: Duration) -> Self {
        let mut floor = Duration::ZERO;
        let steps: Vec<Duration> = steps
            .into_iter()
            .map(|step| {
                floor = floor.max(step);
                floor
            })
            .collect();
        let steps = if steps.is_empty() {
            vec![Duration::from_secs(1)]
        } else {
            steps
        };
        let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        Self {
            steps,
            multiplier,
            cap,
        }
    }

    /// Plain exponential backoff: `initial * multiplier^(attempt-1)`.
    pub fn exponential(initial: Duration, multiplier: f64, cap: Duration) -> Self {
        Self::new(vec![initial], multiplier, cap)
    }

    /// Delay before the next attempt after `attempt` consecutive failures
    /// (1-based; 0 is treated as 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1) as usize;
        let delay = if attempt <= self.steps.len() {
            self.steps[attempt - 1]
        } else {
            let last = self.steps[self.steps.len() - 1];
            let extra = (attempt - self.steps.len()).min(i32::MAX as usize) as i32;
            let secs = last.as_secs_f64() * self.multiplier.powi(extra);
            if secs.is_finite() && secs < self.cap.as_secs_f64() {
                Duration::from_secs_f64(secs)
            } else {
                self.cap
            }
        };
        delay.min(self.cap)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        let steps = config
            .steps_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect();
        Self::new(steps, config.multiplier, Duration::from_secs(config.cap_secs))
    }
}

/// The three retry families, each with its own policy.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    pub qualification: BackoffPolicy,
    pub dispatch: BackoffPolicy,
    pub workspace: BackoffPolicy,
}

impl RetryPolicies {
    pub fn delay(&self, family: RetryFamily, attempt: u32) -> Duration {
        self.policy(family).delay_for(attempt)
    }

    pub fn policy(&self, family: RetryFamily) -> &BackoffPolicy {
        match family {
            RetryFamily::Qualification => &self.qualification,
            RetryFamily::Dispatch => &self.dispatch,
            RetryFamily::Workspace => &self.workspace,
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            qualification: (&BackoffConfig::qualification()).into(),
            dispatch: (&BackoffConfig::dispatch()).into(),
            workspace: (&BackoffConfig::workspace()).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn dispatch_schedule_matches_defaults() {
        let policy = RetryPolicies::default().dispatch;
        assert_eq!(policy.delay_for(1), secs(5));
        assert_eq!(policy.delay_for(2), secs(15));
        assert_eq!(policy.delay_for(3), secs(30));
        assert_eq!(policy.delay_for(4), secs(60));
        assert_eq!(policy.delay_for(5), secs(120));
        assert_eq!(policy.delay_for(6), secs(240));
        assert_eq!(policy.delay_for(7), secs(300));
        assert_eq!(policy.delay_for(1_000), secs(300));
    }

    #[test]
    fn zero_attempt_is_first_step() {
        let policy = BackoffPolicy::exponential(secs(10), 2.0, secs(100));
        assert_eq!(policy.delay_for(0), secs(10));
        assert_eq!(policy.delay_for(1), secs(10));
        assert_eq!(policy.delay_for(2), secs(20));
        assert_eq!(policy.delay_for(5), secs(100));
    }

    #[test]
    fn monotonic_up_to_cap() {
        let policies = RetryPolicies::default();
        for family in [
            RetryFamily::Qualification,
            RetryFamily::Dispatch,
            RetryFamily::Workspace,
        ] {
            let policy = policies.policy(family);
            let mut previous = Duration::ZERO;
            for attempt in 1..200 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= previous, "{family} attempt {attempt} decreased");
                assert!(delay <= policy.cap());
                previous = delay;
            }
            assert_eq!(previous, policy.cap());
        }
    }

    #[test]
    fn unsorted_steps_are_flattened() {
        let policy = BackoffPolicy::new(vec![secs(30), secs(10), secs(60)], 0.5, secs(90));
        assert_eq!(policy.delay_for(1), secs(30));
        assert_eq!(policy.delay_for(2), secs(30));
        assert_eq!(policy.delay_for(3), secs(60));
        // multiplier clamped to 1.0
        assert_eq!(policy.delay_for(4), secs(60));
    }
}
