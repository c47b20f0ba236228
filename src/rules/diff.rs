//! Field-level diff between two document snapshots.

use serde_json::Value;

use crate::rules::types::{AffectedKeys, Snapshot};

/// Keys present in either snapshot whose values differ, appear, or
/// disappear. An absent `before` (create) yields every key of `after`; an
/// absent `after` (delete) yields every key of `before`.
pub fn diff(before: Option<&Snapshot>, after: Option<&Snapshot>) -> AffectedKeys {
    let mut affected = AffectedKeys::new();
    let empty = Snapshot::new();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);

    for (key, old) in before {
        match after.get(key) {
            Some(new) if values_equal(old, new) => {}
            _ => {
                affected.insert(key.clone());
            }
        }
    }
    for key in after.keys() {
        if !before.contains_key(key) {
            affected.insert(key.clone());
        }
    }
    affected
}

/// True iff every affected key is in `allowed` (the empty diff qualifies).
pub fn only_affects(affected: &AffectedKeys, allowed: &AffectedKeys) -> bool {
    affected.is_subset(allowed)
}

/// Deep structural equality. Numbers compare by value, so `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => x.as_f64() == y.as_f64(),
            },
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => maps_equal(x, y),
        _ => a == b,
    }
}

pub fn maps_equal(a: &Snapshot, b: &Snapshot) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
}
