use std::collections::BTreeMap;

use serde_json::Value;

/// Flattened representation of a JSON document: nested maps become
/// dot-delimited keys, arrays union their children's values per key. Two
/// documents that differ only in array ordering flatten identically, which
/// is what both the matcher and the diff want from a body comparison.
pub type FlatMap = BTreeMap<String, Vec<String>>;

/// Flatten a JSON value into dotted keys.
pub fn flatten_json(value: &Value) -> FlatMap {
    let mut out = FlatMap::new();
    match value {
        Value::Null => {
            out.insert(String::new(), vec![String::new()]);
        }
        Value::Bool(b) => {
            out.insert(String::new(), vec![b.to_string()]);
        }
        Value::Number(n) => {
            out.insert(String::new(), vec![n.to_string()]);
        }
        Value::String(s) => {
            out.insert(String::new(), vec![s.clone()]);
        }
        Value::Array(items) => {
            for item in items {
                for (key, values) in flatten_json(item) {
                    out.entry(key).or_default().extend(values);
                }
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                for (nested_key, values) in flatten_json(child) {
                    let full_key = if nested_key.is_empty() {
                        key.clone()
                    } else {
                        format!("{key}.{nested_key}")
                    };
                    out.entry(full_key).or_default().extend(values);
                }
            }
        }
    }
    out
}

/// Flatten a body under the `body` prefix when it parses as JSON; `None`
/// when it does not (callers fall back to byte comparison).
pub fn flatten_body(body: &[u8]) -> Option<FlatMap> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let mut out = FlatMap::new();
    for (key, values) in flatten_json(&value) {
        let full_key = if key.is_empty() {
            "body".to_string()
        } else {
            format!("body.{key}")
        };
        out.insert(full_key, values);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn nested_objects_become_dotted_keys() {
        let flat = flatten_json(&json!({"a": {"b": {"c": 1}}, "d": "x"}));
        assert_eq!(flat.get("a.b.c").unwrap(), &vec!["1".to_string()]);
        assert_eq!(flat.get("d").unwrap(), &vec!["x".to_string()]);
    }

    #[test]
    fn arrays_union_values_per_key() {
        let flat = flatten_json(&json!([{"id": 1}, {"id": 2}]));
        assert_eq!(
            flat.get("id").unwrap(),
            &vec!["1".to_string(), "2".to_string()]
        );
    }

    #[test]
    fn array_order_does_not_change_key_set() {
        let a = flatten_json(&json!({"ids": [1, 2, 3]}));
        let b = flatten_json(&json!({"ids": [3, 1, 2]}));
        let mut a_sorted = a.get("ids").unwrap().clone();
        let mut b_sorted = b.get("ids").unwrap().clone();
        a_sorted.sort();
        b_sorted.sort();
        assert_eq!(a_sorted, b_sorted);
    }

    #[test]
    fn scalars_flatten_to_empty_key() {
        let flat = flatten_json(&json!(true));
        assert_eq!(flat.get("").unwrap(), &vec!["true".to_string()]);
    }

    #[test]
    fn body_prefix_is_applied() {
        let flat = flatten_body(br#"{"name":"John Do"}"#).expect("json body");
        assert_eq!(flat.get("body.name").unwrap(), &vec!["John Do".to_string()]);
    }

    #[test]
    fn non_json_body_is_none() {
        assert!(flatten_body(b"plain text").is_none());
    }
}
