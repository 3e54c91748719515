use serde_json::{Map, Value};

use crate::params::ParameterAssignment;

/// Apply a parameter assignment onto a deep copy of the base template.
///
/// The base document is never mutated, so one loaded template can be reused
/// across every assignment in a run.
pub fn inject(base: &Value, assignment: &ParameterAssignment) -> Value {
    let mut doc = base.clone();
    for (path, value) in assignment {
        set_path(&mut doc, path, value.clone());
    }
    doc
}

/// Set a leaf value addressed by a dotted path, creating intermediate
/// objects as needed.
///
/// Path segments that collide with an existing non-object value are
/// overwritten (last-write-wins). This is deliberately permissive: the
/// caller is responsible for paths being structurally compatible with the
/// template.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, intermediate) = match segments.split_last() {
        Some(parts) => parts,
        None => return,
    };

    let mut current = doc;
    for segment in intermediate {
        let map = coerce_object(current);
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    coerce_object(current).insert((*last).to_string(), value);
}

/// Read the value addressed by a dotted path, if present.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

/// Read the value addressed by a dotted path, falling back to a default.
/// Used to read injected URIs back out of a payload for logging.
pub fn get_path_or<'a>(doc: &'a Value, path: &str, default: &'a Value) -> &'a Value {
    get_path(doc, path).unwrap_or(default)
}

fn coerce_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value coerced to object above"),
    }
}
