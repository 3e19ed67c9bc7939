//! Unit tests for gap reconciliation

use candlekeeper::core::reconciler::{
    BackfillPolicy, FetchStrategy, GapReconciler, ReconciliationWarning,
};
use candlekeeper::models::StoreEdges;
use chrono::{DateTime, Duration, TimeZone, Utc};

fn wall_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
}

/// Last closed minute at `wall_clock()`.
fn closed() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 11, 59, 0).unwrap()
}

fn mins(n: i64) -> Duration {
    Duration::minutes(n)
}

fn policy() -> BackfillPolicy {
    BackfillPolicy::from_minutes(100, 1, 1000)
}

#[test]
fn empty_store_plans_full_backfill() {
    let plan = GapReconciler::plan_fetch(None, wall_clock(), &policy());

    assert_eq!(plan.tag(), "full_backfill");
    let window = plan.window.expect("window");
    assert_eq!(window.from, closed() - mins(100));
    assert_eq!(window.to, closed());
    assert!(plan.warnings.is_empty());
}

#[test]
fn short_history_behind_a_gap_is_refetched_whole() {
    let latest = closed() - mins(5);
    let edges = StoreEdges::new(latest - mins(10), latest);

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.strategy, FetchStrategy::GapPlusExtend);
    assert_eq!(plan.tag(), "gap_plus_extend");
    let window = plan.window.expect("window");
    assert_eq!(window.from, closed() - mins(100));
    assert_eq!(window.to, closed());
}

#[test]
fn long_history_behind_a_gap_fetches_only_the_gap() {
    let latest = closed() - mins(5);
    let edges = StoreEdges::new(latest - mins(200), latest);

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.tag(), "gap_only");
    let window = plan.window.expect("window");
    assert_eq!(window.from, latest + mins(1));
    assert_eq!(window.to, closed());
    assert_eq!(window.minutes(), 5);
}

#[test]
fn sufficient_continuous_history_needs_no_fetch() {
    let edges = StoreEdges::new(closed() - mins(100), closed());

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.tag(), "no_action");
    assert!(plan.is_noop());
}

#[test]
fn gap_larger_than_requirement_fetches_gap_regardless_of_span() {
    let latest = closed() - mins(150);
    let edges = StoreEdges::new(latest - mins(3), latest);

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.tag(), "gap_only");
    let window = plan.window.expect("window");
    assert_eq!(window.from, latest + mins(1));
    assert_eq!(window.to, closed());
}

#[test]
fn continuous_but_short_history_extends_backward() {
    let edges = StoreEdges::new(closed() - mins(10), closed());

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.tag(), "extend_backward");
    assert_eq!(plan.window.expect("window").from, closed() - mins(100));
}

#[test]
fn gap_within_threshold_counts_as_continuous() {
    let edges = StoreEdges::new(closed() - mins(300), closed() - mins(1));

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.tag(), "no_action");
}

#[test]
fn zero_threshold_fetches_the_newest_closed_minute() {
    let edges = StoreEdges::new(closed() - mins(300), closed() - mins(1));
    let policy = BackfillPolicy::from_minutes(100, 0, 1000);

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy);

    assert_eq!(plan.tag(), "gap_only");
    let window = plan.window.expect("window");
    assert_eq!(window.from, closed());
    assert_eq!(window.to, closed());
}

#[test]
fn stored_data_ahead_of_clock_is_clamped_with_warning() {
    let edges = StoreEdges::new(closed() - mins(200), closed() + mins(3));

    let plan = GapReconciler::plan_fetch(Some(edges), wall_clock(), &policy());

    assert_eq!(plan.tag(), "no_action");
    assert_eq!(
        plan.warnings,
        vec![ReconciliationWarning::ClockSkew { ahead_by_secs: 180 }]
    );
}

#[test]
fn oversized_window_is_clamped_to_max_fill() {
    let policy = BackfillPolicy::from_minutes(5000, 1, 1000);

    let plan = GapReconciler::plan_fetch(None, wall_clock(), &policy);

    assert_eq!(plan.tag(), "full_backfill_limited");
    assert!(plan.limited);
    let window = plan.window.expect("window");
    assert_eq!(window.from, closed() - mins(1000));
    assert_eq!(window.to, closed());
    assert_eq!(
        plan.warnings,
        vec![ReconciliationWarning::PartialFill { dropped_minutes: 4000 }]
    );
}

#[test]
fn window_never_includes_the_forming_minute() {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    for offset_secs in [0, 1, 29, 59, 60, 61, 3599, 86_399] {
        let now = base + Duration::seconds(offset_secs);
        let plan = GapReconciler::plan_fetch(None, now, &policy());
        let window = plan.window.expect("window");
        let forming = now - Duration::seconds(now.timestamp().rem_euclid(60));
        assert!(window.to < forming, "to={} forming={}", window.to, forming);
        assert_eq!(window.to, forming - mins(1));
    }
}

#[test]
fn reconciler_uses_its_own_policy() {
    let reconciler = GapReconciler::new(BackfillPolicy::default());
    let plan = reconciler.plan(None, wall_clock());
    assert_eq!(plan.window.expect("window").minutes(), 6);
    assert_eq!(reconciler.policy().required, mins(5));
}
