use crate::config::ReaderConfig;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub(crate) struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
    success_streak: u32,
}

impl BackoffPolicy {
    pub(crate) fn new(base: Duration, max: Duration, jitter: f64, success_streak: u32) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            success_streak: success_streak.max(1),
        }
    }

    pub(crate) fn from_config(config: &ReaderConfig) -> Self {
        Self::new(
            config.backoff_base,
            config.max_backoff_duration,
            config.backoff_jitter,
            config.backoff_success_streak,
        )
    }

    /// Highest tier whose un-jittered wait still fits in `max`.
    pub(crate) fn max_tier(&self) -> u32 {
        let mut tier = 0;
        let mut wait = self.base;
        while !wait.is_zero() && wait <= self.max {
            tier += 1;
            match wait.checked_mul(2) {
                Some(next) => wait = next,
                None => break,
            }
        }
        tier
    }

    /// Un-jittered wait for `tier`: `min(base * 2^(tier-1), max)`.
    pub(crate) fn base_wait(&self, tier: u32) -> Duration {
        if tier == 0 {
            return Duration::ZERO;
        }
        1u32.checked_shl(tier - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |wait| wait.min(self.max))
    }

    /// Jittered wait for `tier` given a uniform sample `r` in `[0, 1)`.
    pub(crate) fn wait_with(&self, tier: u32, r: f64) -> Duration {
        let factor = 1.0 + self.jitter * (2.0 * r.clamp(0.0, 1.0) - 1.0);
        self.base_wait(tier).mul_f64(factor.max(0.0)).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackoffPhase {
    /// Tier 0, full flow.
    Normal,
    /// Flow stopped until the instant.
    Waiting(Instant),
    /// Wait elapsed with a tier above 0; allow a single message through.
    Probing,
}

/// Tier bookkeeping for one connection or for the whole reader.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    max_tier: u32,
    tier: u32,
    streak: u32,
    wait_until: Option<Instant>,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            max_tier: policy.max_tier(),
            policy,
            tier: 0,
            streak: 0,
            wait_until: None,
        }
    }

    pub(crate) fn tier(&self) -> u32 {
        self.tier
    }

    pub(crate) fn phase(&self, now: Instant) -> BackoffPhase {
        match self.wait_until {
            Some(until) if until > now => BackoffPhase::Waiting(until),
            _ if self.tier == 0 => BackoffPhase::Normal,
            _ => BackoffPhase::Probing,
        }
    }

    pub(crate) fn is_waiting(&self, now: Instant) -> bool {
        matches!(self.phase(now), BackoffPhase::Waiting(_))
    }

    /// End of the current wait, if one is still running.
    pub(crate) fn deadline(&self, now: Instant) -> Option<Instant> {
        self.wait_until.filter(|until| *until > now)
    }

    /// Records a failure; returns true when the tier changed.
    pub(crate) fn failure_with(&mut self, now: Instant, r: f64) -> bool {
        let previous = self.tier;
        self.tier = (self.tier + 1).min(self.max_tier);
        self.streak = 0;
        self.wait_until = (self.tier > 0).then(|| now + self.policy.wait_with(self.tier, r));
        self.tier != previous
    }

    /// Records a success; returns true when the tier changed.
    ///
    /// Successes during a wait belong to messages delivered before the failure
    /// and are not counted.
    pub(crate) fn success_with(&mut self, now: Instant, r: f64) -> bool {
        if self.tier == 0 || self.is_waiting(now) {
            return false;
        }
        self.streak += 1;
        if self.streak < self.policy.success_streak {
            return false;
        }
        self.streak = 0;
        self.tier -= 1;
        self.wait_until = (self.tier > 0).then(|| now + self.policy.wait_with(self.tier, r));
        true
    }
}
