//! Property-based tests for the rangeset: canonical storage form,
//! agreement with a point-set model, add/remove inversion and swap
//! symmetry.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use covisor_core::rangeset::{RangeSet, RangeSetFlags};
use covisor_core::CoprocError;

fn collect(r: &RangeSet) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    r.report_ranges(0, u64::MAX, |s, e| {
        out.push((s, e));
        0
    });
    out
}

/// Stored ranges must be strictly ascending and pairwise non-adjacent.
fn assert_canonical(ranges: &[(u64, u64)]) {
    for &(s, e) in ranges {
        assert!(s <= e);
    }
    for w in ranges.windows(2) {
        assert!(w[0].1 + 1 < w[1].0, "ranges {:?} overlap or touch", w);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Add(u64, u64),
    Remove(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (0u64..240, 0u64..16, any::<bool>()).prop_map(|(s, len, add)| {
        if add {
            Op::Add(s, s + len)
        } else {
            Op::Remove(s, s + len)
        }
    })
}

fn apply(r: &RangeSet, model: &mut BTreeSet<u64>, op: &Op) {
    match *op {
        Op::Add(s, e) => {
            r.add_range(s, e).unwrap();
            model.extend(s..=e);
        }
        Op::Remove(s, e) => {
            r.remove_range(s, e).unwrap();
            for p in s..=e {
                model.remove(&p);
            }
        }
    }
}

proptest! {
    #[test]
    fn canonical_form_and_model_agreement(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let r = RangeSet::new("prop", RangeSetFlags::empty());
        let mut model = BTreeSet::new();

        for op in &ops {
            apply(&r, &mut model, op);

            let stored = collect(&r);
            assert_canonical(&stored);

            // The stored ranges cover exactly the model's points.
            let covered: BTreeSet<u64> =
                stored.iter().flat_map(|&(s, e)| s..=e).collect();
            prop_assert_eq!(&covered, &model);
        }

        prop_assert_eq!(r.is_empty(), model.is_empty());
    }

    #[test]
    fn contains_and_overlaps_match_model(
        ops in prop::collection::vec(op_strategy(), 0..24),
        s in 0u64..250,
        len in 0u64..16,
    ) {
        let r = RangeSet::new("query", RangeSetFlags::empty());
        let mut model = BTreeSet::new();
        for op in &ops {
            apply(&r, &mut model, op);
        }

        let e = s + len;
        prop_assert_eq!(r.contains_range(s, e), (s..=e).all(|p| model.contains(&p)));
        prop_assert_eq!(r.overlaps_range(s, e), (s..=e).any(|p| model.contains(&p)));
        if s == e {
            prop_assert_eq!(r.contains_singleton(s), model.contains(&s));
        }
    }

    #[test]
    fn add_then_remove_restores_prior_state(
        ops in prop::collection::vec(op_strategy(), 0..24),
        s in 0u64..250,
        len in 0u64..16,
    ) {
        let r = RangeSet::new("inverse", RangeSetFlags::empty());
        let mut model = BTreeSet::new();
        for op in &ops {
            apply(&r, &mut model, op);
        }

        let e = s + len;
        // Clear [s, e] first so the later removal cannot take pre-existing
        // points with it.
        r.remove_range(s, e).unwrap();
        let before = collect(&r);

        r.add_range(s, e).unwrap();
        r.remove_range(s, e).unwrap();
        prop_assert_eq!(collect(&r), before);
    }

    #[test]
    fn double_swap_is_identity(
        ops_a in prop::collection::vec(op_strategy(), 0..16),
        ops_b in prop::collection::vec(op_strategy(), 0..16),
    ) {
        let a = RangeSet::new("a", RangeSetFlags::empty());
        let b = RangeSet::new("b", RangeSetFlags::empty());
        let mut model_a = BTreeSet::new();
        let mut model_b = BTreeSet::new();
        for op in &ops_a {
            apply(&a, &mut model_a, op);
        }
        for op in &ops_b {
            apply(&b, &mut model_b, op);
        }

        let before_a = collect(&a);
        let before_b = collect(&b);

        RangeSet::swap(&a, &b);
        prop_assert_eq!(collect(&a), before_b.clone());
        prop_assert_eq!(collect(&b), before_a.clone());

        RangeSet::swap(&a, &b);
        prop_assert_eq!(collect(&a), before_a);
        prop_assert_eq!(collect(&b), before_b);
    }
}

// ---- concrete scenarios ----

#[test]
fn merge_scenario() {
    let r = RangeSet::new("merge", RangeSetFlags::empty());
    r.add_range(10, 20).unwrap();
    r.add_range(21, 30).unwrap();
    r.add_range(5, 9).unwrap();
    assert_eq!(collect(&r), vec![(5, 30)]);
}

#[test]
fn split_scenario() {
    let r = RangeSet::new("split", RangeSetFlags::empty());
    r.add_range(0, 100).unwrap();
    r.remove_range(40, 50).unwrap();
    assert_eq!(collect(&r), vec![(0, 39), (51, 100)]);
}

#[test]
fn limit_scenario() {
    let r = RangeSet::new("limit", RangeSetFlags::empty());
    r.limit(1);
    r.add_singleton(0).unwrap();
    assert_eq!(r.add_singleton(2), Err(CoprocError::OutOfMemory));
    r.add_singleton(1).unwrap();
    assert_eq!(collect(&r), vec![(0, 2)]);
}

#[test]
fn shared_handles_see_one_set() {
    let r: Arc<RangeSet> = RangeSet::new("shared", RangeSetFlags::empty());
    let r2 = r.clone();
    r.add_range(1, 2).unwrap();
    assert!(r2.contains_range(1, 2));
}
