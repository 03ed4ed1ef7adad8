//! Conflict detection and reconciliation of source answers

use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{ConflictStrategy, SourceResponse};

/// A numeric field on which sources disagree beyond the threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    /// Dotted path of the field
    pub field: String,
    pub min: f64,
    pub max: f64,
    pub spread_pct: f64,
    pub values: Vec<(String, f64)>,
}

fn flatten_into(value: &Value, prefix: &str, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(child, &path, out);
            }
        }
        Value::Null => {}
        leaf => {
            let path = if prefix.is_empty() { "value" } else { prefix };
            out.insert(path.to_string(), leaf.clone());
        }
    }
}

/// Leaf values of a JSON document keyed by dotted path. Arrays are leaves.
pub fn flatten_leaves(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, "", &mut out);
    out
}

fn within_threshold(a: f64, b: f64, threshold: f64) -> bool {
    let reference = a.abs().max(b.abs());
    reference == 0.0 || (a - b).abs() <= threshold * reference
}

/// Group same-named numeric fields across sources and flag every field whose
/// max - min exceeds `threshold` of max.
pub fn detect_conflicts(responses: &[SourceResponse], threshold: f64) -> Vec<FieldConflict> {
    let mut fields: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();

    for response in responses {
        for (path, leaf) in flatten_leaves(&response.value) {
            if let Some(number) = leaf.as_f64() {
                fields
                    .entry(path)
                    .or_default()
                    .push((response.server_id.clone(), number));
            }
        }
    }

    fields
        .into_iter()
        .filter(|(_, values)| values.len() >= 2)
        .filter_map(|(field, values)| {
            let min = values.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
            let max = values.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
            let reference = max.abs();
            if reference > 0.0 && (max - min) > threshold * reference {
                Some(FieldConflict {
                    field,
                    min,
                    max,
                    spread_pct: (max - min) / reference * 100.0,
                    values,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Number of (field, other source) pairs agreeing with each response
fn agreement_tally(responses: &[SourceResponse], threshold: f64) -> Vec<usize> {
    let leaves: Vec<BTreeMap<String, Value>> =
        responses.iter().map(|r| flatten_leaves(&r.value)).collect();

    leaves
        .iter()
        .enumerate()
        .map(|(i, own)| {
            let mut tally = 0;
            for (path, value) in own {
                for (j, other) in leaves.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    let agrees = match (value.as_f64(), other.get(path)) {
                        (Some(a), Some(theirs)) => theirs
                            .as_f64()
                            .map(|b| within_threshold(a, b, threshold))
                            .unwrap_or(false),
                        (None, Some(theirs)) => theirs == value,
                        (_, None) => false,
                    };
                    if agrees {
                        tally += 1;
                    }
                }
            }
            tally
        })
        .collect()
}

/// Order in which responses seed the merge
pub fn seed_order(
    responses: &[SourceResponse],
    strategy: ConflictStrategy,
    threshold: f64,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..responses.len()).collect();
    let by_rank = |a: &usize, b: &usize| responses[*a].rank.cmp(&responses[*b].rank);

    match strategy {
        ConflictStrategy::PriorityBased => order.sort_by(by_rank),
        ConflictStrategy::MajorityVote => {
            let tally = agreement_tally(responses, threshold);
            order.sort_by(|a, b| tally[*b].cmp(&tally[*a]).then_with(|| by_rank(a, b)));
        }
        ConflictStrategy::QualityWeighted => {
            let sizes: Vec<usize> = responses
                .iter()
                .map(|r| flatten_leaves(&r.value).len())
                .collect();
            let widest = sizes.iter().copied().max().unwrap_or(0).max(1) as f64;
            let scores: Vec<f64> = responses
                .iter()
                .zip(&sizes)
                .map(|(r, size)| r.reliability * (*size as f64 / widest))
                .collect();
            order.sort_by(|a, b| {
                scores[*b]
                    .partial_cmp(&scores[*a])
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| by_rank(a, b))
            });
        }
    }

    order
}

fn backfill(target: &mut Value, source: &Value) {
    if let (Value::Object(target), Value::Object(source)) = (target, source) {
        for (key, value) in source {
            match target.get_mut(key) {
                Some(existing) => backfill(existing, value),
                None => {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Merge responses: the first in seed order wins every field it carries,
/// later ones only fill fields still missing.
pub fn reconcile(
    responses: &[SourceResponse],
    strategy: ConflictStrategy,
    threshold: f64,
) -> Value {
    let mut merged = Value::Null;
    for index in seed_order(responses, strategy, threshold) {
        let value = &responses[index].value;
        if merged.is_null() {
            merged = value.clone();
        } else {
            backfill(&mut merged, value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str, rank: usize, reliability: f64, value: Value) -> SourceResponse {
        SourceResponse {
            server_id: id.to_string(),
            rank,
            reliability,
            value,
        }
    }

    #[test]
    fn test_spread_below_threshold_is_not_a_conflict() {
        let responses = vec![
            response("a", 0, 1.0, json!({ "price": 100.0 })),
            response("b", 1, 1.0, json!({ "price": 103.0 })),
        ];
        assert!(detect_conflicts(&responses, 0.05).is_empty());
    }

    #[test]
    fn test_single_field_conflict() {
        let responses = vec![
            response("a", 0, 1.0, json!({ "price": 100.0, "volume": 10.0, "venue": "x" })),
            response("b", 1, 1.0, json!({ "price": 110.0, "volume": 10.0, "venue": "y" })),
        ];
        let conflicts = detect_conflicts(&responses, 0.05);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "price");
        assert!((conflicts[0].spread_pct - 100.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_nested_fields_use_dotted_paths() {
        let responses = vec![
            response("a", 0, 1.0, json!({ "book": { "bid": 1.0 } })),
            response("b", 1, 1.0, json!({ "book": { "bid": 2.0 } })),
        ];
        let conflicts = detect_conflicts(&responses, 0.05);
        assert_eq!(conflicts[0].field, "book.bid");
    }

    #[test]
    fn test_priority_merge_backfills_missing_fields() {
        let responses = vec![
            response("b", 1, 1.0, json!({ "price": 103.0, "volume": 5.0 })),
            response("a", 0, 1.0, json!({ "price": 100.0 })),
        ];
        let merged = reconcile(&responses, ConflictStrategy::PriorityBased, 0.05);
        assert_eq!(merged, json!({ "price": 100.0, "volume": 5.0 }));
    }

    #[test]
    fn test_majority_vote_seeds_from_agreeing_sources() {
        let responses = vec![
            response("outlier", 0, 1.0, json!({ "price": 150.0 })),
            response("b", 1, 1.0, json!({ "price": 100.0 })),
            response("c", 2, 1.0, json!({ "price": 101.0 })),
        ];
        let merged = reconcile(&responses, ConflictStrategy::MajorityVote, 0.05);
        assert_eq!(merged, json!({ "price": 100.0 }));
    }

    #[test]
    fn test_quality_weighted_prefers_reliable_complete_source() {
        let responses = vec![
            response("flaky", 0, 0.2, json!({ "price": 99.0 })),
            response("solid", 1, 1.0, json!({ "price": 100.0, "volume": 7.0 })),
        ];
        let order = seed_order(&responses, ConflictStrategy::QualityWeighted, 0.05);
        assert_eq!(order, vec![1, 0]);
    }
}
