//! Nested JSON → flat [`Record`] transform.
//!
//! Map keys are joined with `.`, sequence elements are addressed as `[index]`:
//!
//! ```
//! use mesura::flatten::flatten;
//! use serde_json::json;
//!
//! let record = flatten(&json!({"a": {"b": 1}, "c": [1, 2]}), &[]);
//! let keys: Vec<_> = record.keys().collect();
//! assert_eq!(keys, ["a.b", "c[0]", "c[1]"]);
//! ```
use crate::record::{FieldValue, Record};
use serde_json::Value;

/// Key used when the input is a bare scalar.
pub const SCALAR_KEY: &str = "value";

/// Flattens `value`, skipping any map entry whose key is in `excluded`.
///
/// Input must be acyclic, which `serde_json::Value` guarantees.
pub fn flatten(value: &Value, excluded: &[&str]) -> Record {
    let mut record = Record::new();
    walk(value, None, excluded, &mut record);
    record
}

fn walk(value: &Value, prefix: Option<&str>, excluded: &[&str], out: &mut Record) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if excluded.contains(&key.as_str()) {
                    continue;
                }
                let path = match prefix {
                    Some(p) => format!("{}.{}", p, key),
                    None => key.clone(),
                };
                walk(child, Some(&path), excluded, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let path = format!("{}[{}]", prefix.unwrap_or(""), index);
                walk(child, Some(&path), excluded, out);
            }
        }
        scalar => {
            out.insert(prefix.unwrap_or(SCALAR_KEY), FieldValue::from_json(scalar));
        }
    }
}
