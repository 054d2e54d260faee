//! Cluster normalization and batch selection

use mend_core::{ClusterId, ErrorCluster, QueueSnapshot, SequenceIndex};
use std::collections::{BTreeMap, BTreeSet};

/// Pick at most `max_count` clusters for one batch
///
/// Ranked by parsability (`parsable` first), then member count descending,
/// then cluster id ascending. The result does not depend on input order.
/// Repeated ids are reported once.
#[must_use]
pub fn select(clusters: &[ErrorCluster], max_count: usize) -> Vec<ClusterId> {
    let mut ranked: Vec<&ErrorCluster> = clusters.iter().collect();
    ranked.sort_by(|a, b| {
        a.parsability
            .rank()
            .cmp(&b.parsability.rank())
            .then_with(|| b.member_indices.len().cmp(&a.member_indices.len()))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    let mut seen = BTreeSet::new();
    ranked
        .into_iter()
        .filter(|c| seen.insert(&c.cluster_id))
        .take(max_count)
        .map(|c| c.cluster_id.clone())
        .collect()
}

/// Clean up raw clustering output against the snapshot it was built from
///
/// - clusters sharing an id are merged (members and examples unioned,
///   best parsability kept, first non-empty commonality kept)
/// - member indices not in the snapshot are dropped
/// - members are sorted and deduplicated
/// - clusters left without members are dropped
///
/// Output is ordered by cluster id.
#[must_use]
pub fn normalize_clusters(raw: Vec<ErrorCluster>, snapshot: &QueueSnapshot) -> Vec<ErrorCluster> {
    let mut merged: BTreeMap<ClusterId, ErrorCluster> = BTreeMap::new();

    for cluster in raw {
        match merged.get_mut(&cluster.cluster_id) {
            Some(existing) => {
                existing.member_indices.extend(cluster.member_indices);
                existing.parsability = existing.parsability.min(cluster.parsability);
                if existing.commonality.is_empty() {
                    existing.commonality = cluster.commonality;
                }
                for example in cluster.examples {
                    if !existing.examples.contains(&example) {
                        existing.examples.push(example);
                    }
                }
            }
            None => {
                merged.insert(cluster.cluster_id.clone(), cluster);
            }
        }
    }

    merged
        .into_values()
        .filter_map(|mut cluster| {
            let members: BTreeSet<SequenceIndex> = cluster
                .member_indices
                .iter()
                .copied()
                .filter(|i| snapshot.contains(*i))
                .collect();
            if members.is_empty() {
                return None;
            }
            cluster.member_indices = members.into_iter().collect();
            Some(cluster)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mend_core::{FailureRecord, Parsability};
    use pretty_assertions::assert_eq;

    fn cluster(id: &str, members: &[u64], parsability: Parsability) -> ErrorCluster {
        ErrorCluster::new(
            ClusterId::new(id).unwrap(),
            members.iter().copied().map(SequenceIndex),
            parsability,
        )
    }

    fn snapshot(indices: &[u64]) -> QueueSnapshot {
        QueueSnapshot::new(
            indices
                .iter()
                .map(|&i| FailureRecord {
                    sequence_index: SequenceIndex(i),
                    input_text: format!("input {i}"),
                    observed_at: Utc::now(),
                    context: serde_json::Value::Null,
                })
                .collect(),
        )
    }

    fn ids(selected: &[ClusterId]) -> Vec<&str> {
        selected.iter().map(ClusterId::as_str).collect()
    }

    #[test]
    fn parsability_then_size_then_id() {
        let clusters = vec![
            cluster("ambiguous_big", &[1, 2, 3, 4, 5, 6], Parsability::Ambiguous),
            cluster("parsable_small", &[7], Parsability::Parsable),
            cluster("context_mid", &[8, 9], Parsability::ContextDependent),
            cluster("parsable_big", &[10, 11, 12], Parsability::Parsable),
            cluster("parsable_b", &[13], Parsability::Parsable),
        ];
        assert_eq!(
            ids(&select(&clusters, 10)),
            vec![
                "parsable_big",
                "parsable_b",
                "parsable_small",
                "context_mid",
                "ambiguous_big"
            ]
        );
        assert_eq!(ids(&select(&clusters, 2)), vec!["parsable_big", "parsable_b"]);
        assert!(select(&clusters, 0).is_empty());
    }

    #[test]
    fn normalize_merges_and_filters() {
        let snap = snapshot(&[0, 1, 2, 3]);
        let raw = vec![
            cluster("relative_dates", &[0, 1, 9], Parsability::ContextDependent),
            cluster("ghosts", &[42, 43], Parsability::Parsable),
            cluster("relative_dates", &[1, 2], Parsability::Parsable)
                .with_examples(vec!["in 2 days".to_string()]),
        ];

        let normalized = normalize_clusters(raw, &snap);
        assert_eq!(normalized.len(), 1);
        let merged = &normalized[0];
        assert_eq!(
            merged.member_indices,
            vec![SequenceIndex(0), SequenceIndex(1), SequenceIndex(2)]
        );
        assert_eq!(merged.parsability, Parsability::Parsable);
        assert_eq!(merged.examples, vec!["in 2 days".to_string()]);
    }
}
