use std::collections::HashMap;

use crate::types::{FailureCluster, FailureRecord};

const MESSAGE_KEY_CHARS: usize = 120;
const NAME_KEY_CHARS: usize = 60;
const SUMMARY_CHARS: usize = 280;

fn prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Grouping key: message prefix followed by test id prefix.
pub fn signature(failure: &FailureRecord) -> String {
    format!(
        "{}{}",
        prefix(&failure.message, MESSAGE_KEY_CHARS),
        prefix(&failure.test_name, NAME_KEY_CHARS)
    )
}

/// Single pass grouping. Clusters come out in first-appearance order and
/// keep their members in input order.
pub fn cluster_failures(failures: &[FailureRecord]) -> Vec<FailureCluster> {
    let mut clusters: Vec<FailureCluster> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for failure in failures {
        let sig = signature(failure);
        match index.get(&sig) {
            Some(&i) => {
                clusters[i].count += 1;
                clusters[i].items.push(failure.clone());
            }
            None => {
                index.insert(sig.clone(), clusters.len());
                clusters.push(FailureCluster {
                    signature: sig,
                    summary: prefix(&failure.message, SUMMARY_CHARS).to_string(),
                    count: 1,
                    items: vec![failure.clone()],
                });
            }
        }
    }
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn failure(name: &str, message: &str) -> FailureRecord {
        FailureRecord {
            test_name: name.into(),
            file: name.split("::").next().unwrap_or_default().into(),
            line: 0,
            message: message.into(),
            stacktrace: String::new(),
            kind: "failure".into(),
        }
    }

    fn counts(clusters: &[FailureCluster]) -> BTreeMap<String, usize> {
        clusters.iter().map(|c| (c.signature.clone(), c.count)).collect()
    }

    #[test]
    fn messages_differing_after_120_chars_share_a_signature() {
        let base = "x".repeat(120);
        let a = failure("t.py::test_a", &format!("{base}first tail"));
        let b = failure("t.py::test_a", &format!("{base}second tail"));
        let clusters = cluster_failures(&[a.clone(), b.clone()]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].count, 2);
        assert_eq!(clusters[0].items, vec![a, b]);
    }

    #[test]
    fn messages_differing_within_120_chars_split() {
        let clusters = cluster_failures(&[
            failure("t.py::test_a", "AssertionError: 1 != 2"),
            failure("t.py::test_a", "AssertionError: 1 != 3"),
        ]);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_name_beyond_60_chars_is_ignored() {
        let stem = format!("t.py::{}", "n".repeat(60));
        let clusters = cluster_failures(&[
            failure(&format!("{stem}_one"), "boom"),
            failure(&format!("{stem}_two"), "boom"),
        ]);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn grouping_is_order_independent() {
        let input = vec![
            failure("a.py::t1", "E1"),
            failure("b.py::t2", "E2"),
            failure("a.py::t1", "E1"),
            failure("c.py::t3", "E3"),
            failure("b.py::t2", "E2"),
        ];
        let forward = counts(&cluster_failures(&input));
        let mut reversed = input.clone();
        reversed.reverse();
        let backward = counts(&cluster_failures(&reversed));
        assert_eq!(forward, backward);
        assert_eq!(forward.values().sum::<usize>(), input.len());
    }

    #[test]
    fn clusters_keep_first_appearance_order_and_are_idempotent() {
        let input = vec![
            failure("b.py::t", "second"),
            failure("a.py::t", "first"),
            failure("b.py::t", "second"),
        ];
        let once = cluster_failures(&input);
        assert_eq!(once[0].items[0].test_name, "b.py::t");
        assert_eq!(once[1].items[0].test_name, "a.py::t");
        assert_eq!(once, cluster_failures(&input));
    }

    #[test]
    fn summary_is_truncated_on_char_boundaries() {
        let msg = "é".repeat(400);
        let clusters = cluster_failures(&[failure("t.py::x", &msg)]);
        assert_eq!(clusters[0].summary.chars().count(), 280);
        assert!(signature(&clusters[0].items[0]).starts_with(&"é".repeat(120)));
    }

    #[test]
    fn no_failures_no_clusters() {
        assert!(cluster_failures(&[]).is_empty());
    }
}
