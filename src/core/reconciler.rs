//! Gap detection and backfill window planning
//!
//! Given the stored edges of a series and the wall clock, decides the
//! smallest window of closed one-minute candles that must be fetched so the
//! series holds at least `required` minutes of continuous history.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::core::clock::floor_minute;
use crate::models::StoreEdges;

/// Policy knobs for planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillPolicy {
    /// Minimum continuous history to hold.
    pub required: Duration,
    /// Largest gap still treated as continuous.
    pub gap_threshold: Duration,
    /// Upper bound on a single fetch window.
    pub max_fill: Duration,
}

impl BackfillPolicy {
    pub fn from_minutes(required: i64, gap_threshold: i64, max_fill: i64) -> Self {
        Self {
            required: Duration::minutes(required),
            gap_threshold: Duration::minutes(gap_threshold),
            max_fill: Duration::minutes(max_fill),
        }
    }
}

impl Default for BackfillPolicy {
    fn default() -> Self {
        Self::from_minutes(5, 1, 1000)
    }
}

/// Which rule produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    FullBackfill,
    ExtendBackward,
    GapPlusExtend,
    GapOnly,
    NoAction,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::FullBackfill => "full_backfill",
            FetchStrategy::ExtendBackward => "extend_backward",
            FetchStrategy::GapPlusExtend => "gap_plus_extend",
            FetchStrategy::GapOnly => "gap_only",
            FetchStrategy::NoAction => "no_action",
        }
    }
}

/// Non-fatal conditions noticed while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReconciliationWarning {
    /// The newest stored candle is ahead of the clock; the gap was clamped to 0.
    ClockSkew { ahead_by_secs: i64 },
    /// The window was cut to `max_fill`; older history stays missing.
    PartialFill { dropped_minutes: i64 },
}

/// Inclusive window of closed candles to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl FetchWindow {
    /// Number of one-minute candles the window covers.
    pub fn minutes(&self) -> i64 {
        (self.to - self.from).num_minutes() + 1
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts <= self.to
    }
}

/// Result of [`GapReconciler::plan_fetch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchPlan {
    pub strategy: FetchStrategy,
    pub limited: bool,
    /// `None` when no fetch is needed.
    pub window: Option<FetchWindow>,
    pub warnings: Vec<ReconciliationWarning>,
}

impl FetchPlan {
    /// Tag such as `gap_only` or `full_backfill_limited`.
    pub fn tag(&self) -> String {
        if self.limited {
            format!("{}_limited", self.strategy.as_str())
        } else {
            self.strategy.as_str().to_string()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.window.is_none()
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window {
            Some(w) => write!(f, "{} [{} .. {}]", self.tag(), w.from, w.to),
            None => write!(f, "{}", self.tag()),
        }
    }
}

/// Stateless planner; all inputs are explicit.
#[derive(Debug, Clone, Copy, Default)]
pub struct GapReconciler {
    policy: BackfillPolicy,
}

impl GapReconciler {
    pub fn new(policy: BackfillPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackfillPolicy {
        &self.policy
    }

    /// Last closed minute at `now`. The currently forming minute is never
    /// part of a window.
    pub fn last_closed_minute(now: DateTime<Utc>) -> DateTime<Utc> {
        floor_minute(now) - Duration::minutes(1)
    }

    pub fn plan(&self, edges: Option<StoreEdges>, now: DateTime<Utc>) -> FetchPlan {
        Self::plan_fetch(edges, now, &self.policy)
    }

    /// Plan the minimal fetch. Gaps and spans are measured against the last
    /// closed minute, which is also the window's inclusive upper bound.
    pub fn plan_fetch(edges: Option<StoreEdges>, now: DateTime<Utc>, policy: &BackfillPolicy) -> FetchPlan {
        let to = Self::last_closed_minute(now);
        let mut warnings = Vec::new();

        let Some(edges) = edges else {
            return Self::bounded(FetchStrategy::FullBackfill, to - policy.required, to, policy, warnings);
        };

        let mut gap = to - edges.latest;
        if gap < Duration::zero() {
            warn!(
                latest = %edges.latest,
                until = %to,
                "GapReconciler: clock skew, latest stored candle is {}s ahead",
                -gap.num_seconds()
            );
            warnings.push(ReconciliationWarning::ClockSkew {
                ahead_by_secs: -gap.num_seconds(),
            });
            gap = Duration::zero();
        }

        if gap <= policy.gap_threshold {
            let existing = to - edges.oldest;
            if existing >= policy.required {
                return FetchPlan {
                    strategy: FetchStrategy::NoAction,
                    limited: false,
                    window: None,
                    warnings,
                };
            }
            return Self::bounded(FetchStrategy::ExtendBackward, to - policy.required, to, policy, warnings);
        }

        let span = edges.latest - edges.oldest;
        if gap + span < policy.required {
            Self::bounded(FetchStrategy::GapPlusExtend, to - policy.required, to, policy, warnings)
        } else {
            Self::bounded(
                FetchStrategy::GapOnly,
                edges.latest + Duration::minutes(1),
                to,
                policy,
                warnings,
            )
        }
    }

    fn bounded(
        strategy: FetchStrategy,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        policy: &BackfillPolicy,
        mut warnings: Vec<ReconciliationWarning>,
    ) -> FetchPlan {
        let mut from = from;
        let mut limited = false;
        if to - from > policy.max_fill {
            let clamped = to - policy.max_fill;
            warnings.push(ReconciliationWarning::PartialFill {
                dropped_minutes: (clamped - from).num_minutes(),
            });
            from = clamped;
            limited = true;
        }
        FetchPlan {
            strategy,
            limited,
            window: Some(FetchWindow { from, to }),
            warnings,
        }
    }
}
