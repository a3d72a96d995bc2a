use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted gate state; lives in the store snapshot.
///
/// `cooldown_until`, when set, is never earlier than `last_run_time`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownState {
    /// Last run that actually published something.
    pub last_run_time: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// 0 = no rate-limit hit since the last successful run.
    pub escalation_level: u32,
}

/// Throttle + escalation schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub min_interval: Duration,
    /// `tiers[n - 1]` is the cooldown for escalation level `n`; the last tier is the ceiling.
    tiers: Vec<Duration>,
}

impl CooldownPolicy {
    /// Tiers are sorted so the schedule is non-decreasing; an empty list falls back to
    /// a single tier equal to `min_interval`.
    pub fn new(min_interval: Duration, mut tiers: Vec<Duration>) -> Self {
        tiers.retain(|d| *d > Duration::zero());
        tiers.sort();
        if tiers.is_empty() {
            tiers.push(min_interval);
        }
        Self {
            min_interval,
            tiers,
        }
    }

    pub fn tiers(&self) -> &[Duration] {
        &self.tiers
    }

    /// Highest level the state machine will record.
    pub fn max_level(&self) -> u32 {
        self.tiers.len() as u32
    }

    /// Cooldown length for `level` (>= 1), capped at the last tier.
    pub fn duration(&self, level: u32) -> Duration {
        let idx = (level.max(1) as usize - 1).min(self.tiers.len() - 1);
        self.tiers[idx]
    }
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::new(
            Duration::minutes(90),
            vec![Duration::minutes(120), Duration::minutes(360)],
        )
    }
}

/// Why a run was or was not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Ready,
    IntervalNotElapsed { next_allowed: DateTime<Utc> },
    Cooling { level: u32, until: DateTime<Utc> },
}

impl GateDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, GateDecision::Ready)
    }
}

/// Rate-limit state machine: `Ready` / `Cooling(level, until)`.
#[derive(Debug, Clone, Default)]
pub struct CooldownGate {
    policy: CooldownPolicy,
}

impl CooldownGate {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CooldownPolicy {
        &self.policy
    }

    /// Evaluate eligibility at `now`. Does NOT mutate state.
    pub fn check(&self, state: &CooldownState, now: DateTime<Utc>) -> GateDecision {
        if let Some(until) = state.cooldown_until {
            if now < until {
                return GateDecision::Cooling {
                    level: state.escalation_level,
                    until,
                };
            }
        }
        if let Some(last) = state.last_run_time {
            if now.signed_duration_since(last) < self.policy.min_interval {
                return GateDecision::IntervalNotElapsed {
                    next_allowed: last + self.policy.min_interval,
                };
            }
        }
        GateDecision::Ready
    }

    pub fn may_run(&self, state: &CooldownState, now: DateTime<Utc>) -> bool {
        self.check(state, now).is_ready()
    }

    /// Apply a finished run's outcome.
    ///
    /// - `succeeded` advances `last_run_time`; nothing else does.
    /// - `was_rate_limited` escalates one level (capped) and opens a new window from `now`,
    ///   whatever `succeeded` says.
    /// - A success without rate limiting returns the machine to `Ready` with level 0.
    /// - Any other outcome only clears an expired window; the level is kept.
    pub fn record_run_outcome(
        &self,
        state: &mut CooldownState,
        now: DateTime<Utc>,
        succeeded: bool,
        was_rate_limited: bool,
    ) {
        if succeeded {
            state.last_run_time = Some(now);
        }

        if was_rate_limited {
            let level = state
                .escalation_level
                .saturating_add(1)
                .min(self.policy.max_level());
            let mut until = now + self.policy.duration(level);
            if let Some(last) = state.last_run_time {
                until = until.max(last);
            }
            // Never shorten a window that is still open.
            if let Some(prev) = state.cooldown_until {
                until = until.max(prev);
            }
            state.escalation_level = level;
            state.cooldown_until = Some(until);
            tracing::warn!(target: "gate", level, until = %until, "rate limited, cooling down");
            return;
        }

        if succeeded {
            if state.escalation_level > 0 {
                tracing::info!(target: "gate", from = state.escalation_level, "escalation reset");
            }
            state.escalation_level = 0;
            state.cooldown_until = None;
            return;
        }

        if matches!(state.cooldown_until, Some(until) if now >= until) {
            state.cooldown_until = None;
        }
    }

    /// Push an open window out to `hint` (e.g. a server-provided retry time).
    pub fn extend_cooldown(&self, state: &mut CooldownState, hint: DateTime<Utc>) {
        if let Some(until) = state.cooldown_until {
            if hint > until {
                state.cooldown_until = Some(hint);
            }
        }
    }
}
