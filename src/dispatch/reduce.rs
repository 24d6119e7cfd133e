//! Merge directives for repeated partial results.
//!
//! When several shards produce values under the same output name, a reduce
//! directive decides how two values combine into one. Reduction is pairwise
//! and total: any JSON values can be combined, with degenerate inputs
//! coerced rather than rejected, since partial results from plugins aren't
//! trusted to be well-shaped.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A merge directive: the combination kind plus windowing and sort-merge
/// parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    #[serde(rename = "type")]
    pub kind: Kind,
    /// Sort-merge tie-break rules, applied in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<SortOperator>,
    /// Column identifying records to unify in sort merges. Records sharing
    /// a key are summed element-wise (except the key column itself) and
    /// appear once in the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_column: Option<usize>,
    /// Window size. Negative means unlimited; absent disables windowing
    /// entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Elements skipped before the limit applies.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl Directive {
    pub fn new(kind: Kind) -> Self {
        Self { kind, operators: Vec::new(), key_column: None, limit: None, offset: 0 }
    }

    /// The directive merging error channels: unlimited concatenation.
    pub fn errors() -> Self {
        Self { limit: Some(-1), ..Self::new(Kind::Sum) }
    }
}

/// The combination kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    /// Shallow map merge (later keys win) or numeric/sequence addition.
    Sum,
    /// Like sum, but recurses into nested maps, summing numeric leaves.
    RecursiveSum,
    /// Logical and: returns the incoming value if the accumulated one is
    /// truthy, else the accumulated one. Null and false are falsy.
    And,
    /// Logical or: returns the accumulated value if truthy, else the
    /// incoming one.
    Or,
    /// The mean of the two values. Note this is strictly pairwise: folding
    /// more than two values weights later ones more heavily.
    Average,
    /// Order-preserving merge of two pre-sorted record sequences.
    Sort,
}

/// One sort-merge tie-break rule: compare records by this column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOperator {
    pub column: usize,
    #[serde(default)]
    pub operator: Order,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    #[default]
    #[serde(rename = "<")]
    Ascending,
    #[serde(rename = ">")]
    Descending,
}

/// Merges an incoming value into the accumulated one.
pub fn reduce(accumulated: &Json, incoming: &Json, directive: &Directive) -> Json {
    let merged = match directive.kind {
        Kind::Sum => sum(accumulated, incoming),
        Kind::RecursiveSum => recursive_sum(accumulated, incoming),
        Kind::And => {
            if truthy(accumulated) { incoming.clone() } else { accumulated.clone() }
        }
        Kind::Or => {
            if truthy(accumulated) { accumulated.clone() } else { incoming.clone() }
        }
        Kind::Average => average(accumulated, incoming),
        Kind::Sort => sort_merge(accumulated, incoming, directive),
    };
    window(merged, directive)
}

/// Applies the directive's window to a sequence. Only sequences are
/// windowed, and only when the directive has a limit; a negative limit
/// skips the offset but never truncates.
fn window(value: Json, directive: &Directive) -> Json {
    let Some(limit) = directive.limit else { return value };
    let Json::Array(items) = value else { return value };
    let mut items: Vec<Json> = items.into_iter().skip(directive.offset).collect();
    if limit >= 0 {
        items.truncate(limit as usize);
    }
    Json::Array(items)
}

fn truthy(value: &Json) -> bool {
    !matches!(value, Json::Null | Json::Bool(false))
}

fn sum(a: &Json, b: &Json) -> Json {
    if a.is_object() || b.is_object() {
        // Shallow merge with later keys winning. A non-map side counts as
        // an empty map.
        let mut merged = a.as_object().cloned().unwrap_or_default();
        if let Some(b) = b.as_object() {
            for (key, value) in b {
                merged.insert(key.clone(), value.clone());
            }
        }
        return Json::Object(merged);
    }
    add(a, b)
}

/// Leaf addition: numbers add, sequences and strings concatenate, null
/// yields the other side, anything else takes the incoming value.
fn add(a: &Json, b: &Json) -> Json {
    match (a, b) {
        (Json::Null, b) => b.clone(),
        (a, Json::Null) => a.clone(),
        (Json::Number(x), Json::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                if let Some(total) = x.checked_add(y) {
                    return Json::from(total);
                }
            }
            Json::from(x.as_f64().unwrap_or_default() + y.as_f64().unwrap_or_default())
        }
        (Json::Array(x), Json::Array(y)) => Json::Array(x.iter().chain(y).cloned().collect()),
        (Json::String(x), Json::String(y)) => Json::String(format!("{x}{y}")),
        (_, b) => b.clone(),
    }
}

fn recursive_sum(a: &Json, b: &Json) -> Json {
    match (a, b) {
        (Json::Object(a), Json::Object(b)) => {
            let mut merged = a.clone();
            for (key, value) in b {
                let combined = match a.get(key) {
                    Some(old) => recursive_sum(old, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), combined);
            }
            Json::Object(merged)
        }
        _ => add(a, b),
    }
}

fn average(a: &Json, b: &Json) -> Json {
    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    Json::from((x + y) / 2.0)
}

/// Merges two pre-sorted record sequences, preserving order under the
/// directive's tie-break operators. With a key column, records sharing a
/// key are unified first and the result re-sorted, since unification can
/// reorder neighbors.
fn sort_merge(a: &Json, b: &Json, directive: &Directive) -> Json {
    let a = a.as_array().map(Vec::as_slice).unwrap_or_default();
    let b = b.as_array().map(Vec::as_slice).unwrap_or_default();

    if let Some(key_column) = directive.key_column {
        let mut records: Vec<Json> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for record in a.iter().chain(b) {
            let key = record.get(key_column).cloned().unwrap_or(Json::Null).to_string();
            match by_key.get(&key) {
                Some(&at) => records[at] = unify(&records[at], record, key_column),
                None => {
                    by_key.insert(key, records.len());
                    records.push(record.clone());
                }
            }
        }
        records.sort_by(|x, y| compare(x, y, &directive.operators));
        return Json::Array(records);
    }

    // A plain two-pointer merge, taking from the accumulated side on ties.
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if compare(&a[i], &b[j], &directive.operators) == Ordering::Greater {
            merged.push(b[j].clone());
            j += 1;
        } else {
            merged.push(a[i].clone());
            i += 1;
        }
    }
    merged.extend(a[i..].iter().cloned());
    merged.extend(b[j..].iter().cloned());
    Json::Array(merged)
}

/// Combines two records sharing a key: element-wise addition, except the
/// key column keeps its value.
fn unify(a: &Json, b: &Json, key_column: usize) -> Json {
    let Some(a) = a.as_array() else { return b.clone() };
    let Some(b) = b.as_array() else { return Json::Array(a.clone()) };
    let mut combined = Vec::with_capacity(a.len().max(b.len()));
    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).unwrap_or(&Json::Null);
        let right = b.get(i).unwrap_or(&Json::Null);
        if i == key_column {
            combined.push(if left.is_null() { right.clone() } else { left.clone() });
        } else {
            combined.push(add(left, right));
        }
    }
    Json::Array(combined)
}

fn compare(a: &Json, b: &Json, operators: &[SortOperator]) -> Ordering {
    for operator in operators {
        let left = a.get(operator.column).unwrap_or(&Json::Null);
        let right = b.get(operator.column).unwrap_or(&Json::Null);
        let ordering = match operator.operator {
            Order::Ascending => compare_values(left, right),
            Order::Descending => compare_values(right, left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// A total order over JSON scalars: natural within a type, by type rank
/// across types so comparisons never panic on mixed columns.
fn compare_values(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn rank(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::Bool(_) => 1,
        Json::Number(_) => 2,
        Json::String(_) => 3,
        Json::Array(_) => 4,
        Json::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ascending(column: usize) -> SortOperator {
        SortOperator { column, operator: Order::Ascending }
    }

    #[test]
    fn sum_is_associative_for_numbers_and_sequences() {
        let directive = Directive::new(Kind::Sum);
        let (a, b, c) = (json!(1), json!(2), json!(3));
        let left = reduce(&reduce(&a, &b, &directive), &c, &directive);
        let right = reduce(&a, &reduce(&b, &c, &directive), &directive);
        assert_eq!(left, right);
        assert_eq!(left, json!(6));

        let (a, b, c) = (json!([1]), json!([2]), json!([3]));
        let left = reduce(&reduce(&a, &b, &directive), &c, &directive);
        let right = reduce(&a, &reduce(&b, &c, &directive), &directive);
        assert_eq!(left, right);
        assert_eq!(left, json!([1, 2, 3]));
    }

    #[test]
    fn sum_merges_maps_with_later_keys_winning() {
        let directive = Directive::new(Kind::Sum);
        let merged =
            reduce(&json!({"a": 1, "b": 1}), &json!({"b": 2, "c": 3}), &directive);
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 3}));

        // A non-map side counts as empty.
        assert_eq!(reduce(&json!(5), &json!({"a": 1}), &directive), json!({"a": 1}));
    }

    #[test]
    fn recursive_sum_adds_numeric_leaves() {
        let directive = Directive::new(Kind::RecursiveSum);
        let merged = reduce(
            &json!({"count": 2, "by_tag": {"a": 1}, "records": [[1]], "done": true}),
            &json!({"count": 3, "by_tag": {"a": 2, "b": 1}, "records": [[2]], "done": false}),
            &directive,
        );
        assert_eq!(
            merged,
            json!({"count": 5, "by_tag": {"a": 3, "b": 1}, "records": [[1], [2]], "done": false})
        );
    }

    #[test]
    fn and_or_follow_truthiness() {
        let and = Directive::new(Kind::And);
        let or = Directive::new(Kind::Or);
        assert_eq!(reduce(&json!(true), &json!(false), &and), json!(false));
        assert_eq!(reduce(&json!(false), &json!(true), &and), json!(false));
        assert_eq!(reduce(&json!(null), &json!(true), &and), json!(null));
        assert_eq!(reduce(&json!(true), &json!(false), &or), json!(true));
        assert_eq!(reduce(&json!(false), &json!(17), &or), json!(17));
    }

    #[test]
    fn average_is_the_pairwise_mean() {
        let directive = Directive::new(Kind::Average);
        assert_eq!(reduce(&json!(2), &json!(4), &directive), json!(3.0));
    }

    #[test]
    fn sort_merge_interleaves_presorted_sequences() {
        let mut directive = Directive::new(Kind::Sort);
        directive.operators = vec![ascending(0)];
        let merged = reduce(
            &json!([[1, "a"], [3, "c"], [5, "e"]]),
            &json!([[2, "b"], [3, "z"], [6, "f"]]),
            &directive,
        );
        // Sorted by column 0, and a perfect multiset union of the inputs.
        assert_eq!(
            merged,
            json!([[1, "a"], [2, "b"], [3, "c"], [3, "z"], [5, "e"], [6, "f"]])
        );
    }

    #[test]
    fn sort_merge_descending_and_tie_breaks() {
        let mut directive = Directive::new(Kind::Sort);
        directive.operators =
            vec![SortOperator { column: 0, operator: Order::Descending }, ascending(1)];
        let merged = reduce(&json!([[2, "b"], [1, "x"]]), &json!([[2, "a"], [1, "y"]]), &directive);
        assert_eq!(merged, json!([[2, "a"], [2, "b"], [1, "x"], [1, "y"]]));
    }

    #[test]
    fn sort_merge_unifies_records_sharing_a_key() {
        let mut directive = Directive::new(Kind::Sort);
        directive.operators = vec![ascending(0)];
        directive.key_column = Some(0);
        let merged = reduce(
            &json!([["a", 1], ["b", 2]]),
            &json!([["b", 3], ["c", 4]]),
            &directive,
        );
        assert_eq!(merged, json!([["a", 1], ["b", 5], ["c", 4]]));
    }

    #[test]
    fn windowing_applies_offset_then_limit() {
        let mut directive = Directive::new(Kind::Sum);
        directive.limit = Some(-1);
        let big: Vec<i64> = (0..500).collect();
        let rest: Vec<i64> = (500..1000).collect();
        let merged = reduce(&json!(big), &json!(rest), &directive);
        assert_eq!(merged.as_array().unwrap().len(), 1000, "negative limit never truncates");

        directive.limit = Some(5);
        let merged = reduce(&json!([1, 2, 3]), &json!([4, 5, 6, 7]), &directive);
        assert_eq!(merged, json!([1, 2, 3, 4, 5]));

        directive.offset = 2;
        let merged = reduce(&json!([1, 2, 3]), &json!([4, 5, 6, 7]), &directive);
        assert_eq!(merged, json!([3, 4, 5, 6, 7]));

        directive.limit = Some(0);
        let merged = reduce(&json!([1]), &json!([2]), &directive);
        assert_eq!(merged, json!([]));
    }
}
