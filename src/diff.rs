//! Structural delta between two JSON snapshots.
//!
//! Only additions and changes are reported. A key present in `previous` but
//! absent from `current` does not appear in the output; collectors rebuild
//! state by merging deltas and rely on that.

use serde_json::{Map, Value};

/// Compute the delta that takes `previous` to `current`.
///
/// - Objects are compared key by key and recursed into; a nested object
///   whose delta is empty is omitted.
/// - Scalars and arrays are compared by value (arrays element-wise, so a
///   reordering counts as a change).
/// - Identical inputs produce `{}`.
///
/// When the top-level values are not both objects, the result is `{}` if
/// they are equal and a clone of `current` otherwise.
pub fn diff(previous: &Value, current: &Value) -> Value {
    match (previous, current) {
        (Value::Object(prev), Value::Object(cur)) => Value::Object(diff_objects(prev, cur)),
        _ if previous == current => Value::Object(Map::new()),
        _ => current.clone(),
    }
}

fn diff_objects(prev: &Map<String, Value>, cur: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, cur_value) in cur {
        match prev.get(key) {
            None => {
                out.insert(key.clone(), cur_value.clone());
            }
            Some(Value::Object(prev_obj)) if cur_value.is_object() => {
                if let Value::Object(cur_obj) = cur_value {
                    let nested = diff_objects(prev_obj, cur_obj);
                    if !nested.is_empty() {
                        out.insert(key.clone(), Value::Object(nested));
                    }
                }
            }
            Some(prev_value) if prev_value != cur_value => {
                out.insert(key.clone(), cur_value.clone());
            }
            Some(_) => {}
        }
    }
    out
}
