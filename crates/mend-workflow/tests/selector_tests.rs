//! Selection policy properties

use mend_core::{ClusterId, ErrorCluster, Parsability, SequenceIndex};
use mend_workflow::select;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn cluster(id: &str, members: u64, parsability: Parsability) -> ErrorCluster {
    ErrorCluster::new(
        ClusterId::sanitize(id),
        (0..members).map(SequenceIndex),
        parsability,
    )
}

fn any_parsability() -> impl Strategy<Value = Parsability> {
    prop_oneof![
        Just(Parsability::Parsable),
        Just(Parsability::ContextDependent),
        Just(Parsability::Ambiguous),
    ]
}

fn any_clusters() -> impl Strategy<Value = Vec<ErrorCluster>> {
    prop::collection::btree_map("[a-z]{1,6}", (0u64..12, any_parsability()), 0..12).prop_map(
        |m| {
            m.into_iter()
                .map(|(id, (members, p))| cluster(&id, members, p))
                .collect()
        },
    )
}

#[test]
fn ranks_parsability_then_size_then_id() {
    let clusters = vec![
        cluster("ambiguous_big", 50, Parsability::Ambiguous),
        cluster("context", 9, Parsability::ContextDependent),
        cluster("small", 2, Parsability::Parsable),
        cluster("beta", 7, Parsability::Parsable),
        cluster("alpha", 7, Parsability::Parsable),
    ];
    let ids: Vec<String> = select(&clusters, 4)
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(ids, vec!["alpha", "beta", "small", "context"]);
}

#[test]
fn zero_budget_selects_nothing() {
    let clusters = vec![cluster("alpha", 1, Parsability::Parsable)];
    assert!(select(&clusters, 0).is_empty());
}

proptest! {
    #[test]
    fn prop_selection_ignores_input_order(
        (clusters, shuffled) in any_clusters().prop_flat_map(|c| {
            let shuffled = Just(c.clone()).prop_shuffle();
            (Just(c), shuffled)
        }),
        k in 0usize..8,
    ) {
        prop_assert_eq!(select(&clusters, k), select(&shuffled, k));
    }

    #[test]
    fn prop_selection_is_bounded_prefix(clusters in any_clusters(), k in 0usize..8) {
        let picked = select(&clusters, k);
        prop_assert_eq!(picked.len(), k.min(clusters.len()));
        let all = select(&clusters, clusters.len());
        prop_assert_eq!(&all[..picked.len()], &picked[..]);
    }
}
