//! Property-based tests for the resource counter.
//!
//! These verify the admission invariants of [`ResourceCounter`] under
//! arbitrary operation sequences with proptest.

use proptest::prelude::*;

use crate::counter::{Dimension, ResourceCounter, ResourceStat};
use crate::limit::Limit;

/// Strategy for per-dimension values with headroom against overflow.
fn dim_value() -> impl Strategy<Value = u64> {
    0u64..1_000_000_000
}

fn stat_strategy() -> impl Strategy<Value = ResourceStat> {
    (
        dim_value(),
        dim_value(),
        dim_value(),
        dim_value(),
        dim_value(),
        dim_value(),
    )
        .prop_map(|(memory, ci, co, si, so, fd)| ResourceStat {
            memory,
            conns_inbound: ci,
            conns_outbound: co,
            streams_inbound: si,
            streams_outbound: so,
            fd,
        })
}

fn limit_strategy() -> impl Strategy<Value = Limit> {
    (
        dim_value(),
        dim_value(),
        dim_value(),
        dim_value(),
        dim_value(),
        dim_value(),
    )
        .prop_map(|(memory, ci, co, si, so, fd)| {
            Limit::zero()
                .with_memory(memory)
                .with_conns(ci, co)
                .with_streams(si, so)
                .with_fd(fd)
        })
}

fn within_limit(stat: &ResourceStat, limit: Limit) -> bool {
    Dimension::ALL
        .iter()
        .all(|&d| stat.get(d) <= limit.get(d))
}

proptest! {
    /// Usage never exceeds the limit on any dimension, whatever sequence
    /// of reservations is attempted.
    #[test]
    fn prop_used_never_exceeds_limit(
        limit in limit_strategy(),
        deltas in prop::collection::vec(stat_strategy(), 0..16),
    ) {
        let mut rc = ResourceCounter::new(limit);
        for delta in &deltas {
            let _ = rc.reserve(delta);
            prop_assert!(within_limit(&rc.stat(), limit));
        }
    }

    /// A successful reservation grows every dimension by exactly the delta.
    #[test]
    fn prop_successful_reserve_grows_exactly(
        limit in limit_strategy(),
        delta in stat_strategy(),
    ) {
        let mut rc = ResourceCounter::new(limit);
        let before = rc.stat();

        if rc.reserve(&delta).is_ok() {
            for d in Dimension::ALL {
                prop_assert_eq!(rc.stat().get(d), before.get(d) + delta.get(d));
            }
        }
    }

    /// A failed reservation leaves every dimension unchanged.
    #[test]
    fn prop_failed_reserve_changes_nothing(
        limit in limit_strategy(),
        first in stat_strategy(),
        second in stat_strategy(),
    ) {
        let mut rc = ResourceCounter::new(limit);
        let _ = rc.reserve(&first);
        let before = rc.stat();

        if rc.reserve(&second).is_err() {
            prop_assert_eq!(rc.stat(), before);
        }
    }

    /// Reserve followed by release of the same delta is a no-op.
    #[test]
    fn prop_reserve_release_round_trips(
        limit in limit_strategy(),
        base in stat_strategy(),
        delta in stat_strategy(),
    ) {
        let mut rc = ResourceCounter::new(limit);
        let _ = rc.reserve(&base);
        let before = rc.stat();

        if rc.reserve(&delta).is_ok() {
            rc.release(&delta).unwrap();
            prop_assert_eq!(rc.stat(), before);
        }
    }

    /// Releasing more than was reserved clamps at zero and reports the
    /// violation; it never wraps.
    #[test]
    fn prop_release_clamps_at_zero(
        limit in limit_strategy(),
        reserved in stat_strategy(),
        released in stat_strategy(),
    ) {
        let mut rc = ResourceCounter::new(limit);
        let _ = rc.reserve(&reserved);
        let before = rc.stat();

        let result = rc.release(&released);
        for d in Dimension::ALL {
            prop_assert_eq!(
                rc.stat().get(d),
                before.get(d).saturating_sub(released.get(d))
            );
        }
        let underflowed = Dimension::ALL.iter().any(|&d| released.get(d) > before.get(d));
        prop_assert_eq!(result.is_err(), underflowed);
    }
}
