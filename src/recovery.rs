//! Failure classification and retry decisions.
//!
//! The controller maps a unit failure to one of three outcomes:
//! retry after a backoff delay, skip the unit, or abort it. Retries are
//! bounded by `max_attempts`; the failure of the final allowed attempt
//! resolves to the policy's `on_exhausted` action.

use crate::state::{ErrorCategory, UnitError, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What to do with a failed unit, as configured per error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Retry,
    Skip,
    Abort,
}

/// Category to disposition mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classifier {
    pub transient: Disposition,
    pub timeout: Disposition,
    pub permanent: Disposition,
    pub unknown: Disposition,
}

impl Classifier {
    pub fn classify(&self, category: ErrorCategory) -> Disposition {
        match category {
            ErrorCategory::Transient => self.transient,
            ErrorCategory::Timeout => self.timeout,
            ErrorCategory::Permanent => self.permanent,
            ErrorCategory::Unknown => self.unknown,
            ErrorCategory::Cancelled => Disposition::Abort,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            transient: Disposition::Retry,
            timeout: Disposition::Retry,
            permanent: Disposition::Abort,
            unknown: Disposition::Retry,
        }
    }
}

/// Retry policy of a run. Immutable while the run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub on_exhausted: Disposition,
    pub classifier: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::RunConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_index` (zero-based), with a random
    /// jitter factor.
    pub fn backoff(&self, retry_index: u32) -> Duration {
        self.backoff_with_sample(retry_index, rand::random::<f64>())
    }

    /// Deterministic form of [`backoff`](Self::backoff). `sample` in `[0, 1)`
    /// selects the jitter factor within `[1 - jitter, 1 + jitter)`.
    pub fn backoff_with_sample(&self, retry_index: u32, sample: f64) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 0.99);
        let factor = 1.0 - jitter + 2.0 * jitter * sample.clamp(0.0, 1.0);
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Outcome of a recovery decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Skip,
    Abort,
}

/// Counters kept across the run and stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryCounters {
    /// Failures observed per unit
    #[serde(default)]
    pub failures: BTreeMap<UnitId, u32>,
    #[serde(default)]
    pub retries: u64,
    #[serde(default)]
    pub skips: u64,
    #[serde(default)]
    pub aborts: u64,
}

/// Decides how to handle unit failures.
#[derive(Debug, Clone)]
pub struct RecoveryController {
    policy: RetryPolicy,
    counters: RecoveryCounters,
}

impl RecoveryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_counters(policy, RecoveryCounters::default())
    }

    /// Continue with counters restored from a checkpoint.
    pub fn with_counters(policy: RetryPolicy, counters: RecoveryCounters) -> Self {
        Self { policy, counters }
    }

    pub fn counters(&self) -> &RecoveryCounters {
        &self.counters
    }

    /// Decide the fate of `unit` after it failed with `error`.
    ///
    /// Retries are budgeted by recorded failures, so dispatches that were
    /// interrupted by a cancel or a crash do not use up retries.
    pub fn decide(&mut self, unit: &UnitId, error: &UnitError) -> Decision {
        let failures = self.counters.failures.entry(unit.clone()).or_insert(0);
        *failures += 1;
        let failures = *failures;

        let decision = match self.policy.classifier.classify(error.category) {
            Disposition::Retry if failures <= self.policy.max_attempts => Decision::Retry {
                delay: self.policy.backoff(failures - 1),
            },
            Disposition::Retry => {
                tracing::info!(
                    unit = %unit,
                    failures,
                    max_retries = self.policy.max_attempts,
                    "Retries exhausted"
                );
                match self.policy.on_exhausted {
                    Disposition::Skip => Decision::Skip,
                    Disposition::Retry | Disposition::Abort => Decision::Abort,
                }
            }
            Disposition::Skip => Decision::Skip,
            Disposition::Abort => Decision::Abort,
        };

        match decision {
            Decision::Retry { .. } => self.counters.retries += 1,
            Decision::Skip => self.counters.skips += 1,
            Decision::Abort => self.counters.aborts += 1,
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter,
            on_exhausted: Disposition::Abort,
            classifier: Classifier::default(),
        }
    }

    #[test]
    fn test_backoff_without_jitter_is_exponential() {
        let p = policy(3, 0.0);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_respects_ceiling() {
        let p = policy(3, 0.0);
        assert_eq!(p.backoff(20), Duration::from_secs(10));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let p = policy(3, 0.25);
        for k in 0..4u32 {
            let nominal = 0.1 * 2f64.powi(k as i32);
            let low = nominal * 0.75;
            let high = nominal * 1.25;
            for _ in 0..200 {
                let d = p.backoff(k).as_secs_f64();
                assert!(d >= low - 1e-9 && d <= high + 1e-9, "k={k} d={d}");
            }
        }
    }

    #[test]
    fn test_backoff_sample_extremes() {
        let p = policy(3, 0.5);
        assert_eq!(p.backoff_with_sample(0, 0.0), Duration::from_millis(50));
        assert_eq!(p.backoff_with_sample(0, 0.5), Duration::from_millis(100));
    }

    #[test]
    fn test_transient_retried_until_exhausted() {
        let mut rc = RecoveryController::new(policy(3, 0.0));
        let unit = UnitId::from("01");
        let err = UnitError::transient("flaky");

        for _ in 1..=3 {
            assert!(matches!(rc.decide(&unit, &err), Decision::Retry { .. }));
        }
        assert_eq!(rc.decide(&unit, &err), Decision::Abort);

        assert_eq!(rc.counters().failures[&unit], 4);
        assert_eq!(rc.counters().retries, 3);
        assert_eq!(rc.counters().aborts, 1);
    }

    #[test]
    fn test_retry_delay_uses_zero_based_index() {
        let mut rc = RecoveryController::new(policy(3, 0.0));
        let unit = UnitId::from("01");
        let err = UnitError::transient("flaky");

        assert_eq!(
            rc.decide(&unit, &err),
            Decision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            rc.decide(&unit, &err),
            Decision::Retry {
                delay: Duration::from_millis(200)
            }
        );
    }

    #[test]
    fn test_permanent_aborts_immediately() {
        let mut rc = RecoveryController::new(policy(3, 0.0));
        let decision = rc.decide(&UnitId::from("01"), &UnitError::permanent("bad input"));
        assert_eq!(decision, Decision::Abort);
    }

    #[test]
    fn test_exhaustion_can_skip() {
        let mut p = policy(0, 0.0);
        p.on_exhausted = Disposition::Skip;
        let mut rc = RecoveryController::new(p);
        let decision = rc.decide(&UnitId::from("01"), &UnitError::timeout(Duration::from_secs(1)));
        assert_eq!(decision, Decision::Skip);
        assert_eq!(rc.counters().skips, 1);
    }

    #[test]
    fn test_classifier_override() {
        let mut p = policy(3, 0.0);
        p.classifier.permanent = Disposition::Skip;
        let mut rc = RecoveryController::new(p);
        let decision = rc.decide(&UnitId::from("01"), &UnitError::permanent("nope"));
        assert_eq!(decision, Decision::Skip);
    }

    #[test]
    fn test_restored_failures_count_against_retries() {
        let mut counters = RecoveryCounters::default();
        counters.failures.insert(UnitId::from("01"), 2);
        let mut rc = RecoveryController::with_counters(policy(3, 0.0), counters);
        let err = UnitError::transient("flaky");

        assert_eq!(
            rc.decide(&UnitId::from("01"), &err),
            Decision::Retry {
                delay: Duration::from_millis(400)
            }
        );
        assert_eq!(rc.decide(&UnitId::from("01"), &err), Decision::Abort);
    }

    #[test]
    fn test_counters_restore() {
        let mut counters = RecoveryCounters::default();
        counters.failures.insert(UnitId::from("01"), 2);
        counters.retries = 2;

        let json = serde_json::to_string(&counters).unwrap();
        let restored: RecoveryCounters = serde_json::from_str(&json).unwrap();
        let rc = RecoveryController::with_counters(policy(3, 0.0), restored);
        assert_eq!(rc.counters().failures[&UnitId::from("01")], 2);
        assert_eq!(rc.counters().retries, 2);
    }
}
