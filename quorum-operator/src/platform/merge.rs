//! JSON merge rules used by the in-memory platform.
//!
//! Server-side apply tracks which fields each manager set. Re-applying with a
//! field missing removes it from the object, while fields other managers (or
//! the platform itself) set are left alone. The in-memory platform models
//! this by remembering the last configuration applied to each object.

use serde_json::{Map, Value};

/// Apply `desired` on top of `target` as the manager whose previous applied
/// configuration was `previous`.
///
/// Fields present in `previous` but absent from `desired` are removed. Then
/// `desired` is merged in: objects recurse, arrays and scalars replace.
pub fn apply_owned(target: &mut Value, previous: Option<&Value>, desired: &Value) {
    if let Some(previous) = previous {
        release(target, previous, desired);
    }
    merge(target, desired);
}

fn release(target: &mut Value, previous: &Value, desired: &Value) {
    let (Value::Object(target), Value::Object(previous)) = (target, previous) else {
        return;
    };
    for (key, owned) in previous {
        match desired.get(key).filter(|v| !v.is_null()) {
            None => {
                target.remove(key);
            }
            Some(wanted) => {
                if let Some(current) = target.get_mut(key) {
                    release(current, owned, wanted);
                }
            }
        }
    }
}

fn merge(target: &mut Value, desired: &Value) {
    let Value::Object(desired) = desired else {
        *target = desired.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in desired {
            if value.is_null() {
                continue;
            }
            merge(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// Apply a JSON merge patch in place. `null` removes a key.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dropped_field_is_removed() {
        let previous = json!({"data": {"a": "1", "metrics": "on"}});
        let mut target = json!({"metadata": {"uid": "u"}, "data": {"a": "1", "metrics": "on"}});
        let desired = json!({"data": {"a": "1"}});

        apply_owned(&mut target, Some(&previous), &desired);

        assert_eq!(target, json!({"metadata": {"uid": "u"}, "data": {"a": "1"}}));
    }

    #[test]
    fn foreign_fields_survive() {
        let previous = json!({"metadata": {"labels": {"app": "x"}}});
        let mut target = json!({"metadata": {"labels": {"app": "x", "team": "ops"}}});
        let desired = json!({"metadata": {"labels": {"app": "y"}}});

        apply_owned(&mut target, Some(&previous), &desired);

        assert_eq!(target, json!({"metadata": {"labels": {"app": "y", "team": "ops"}}}));
    }

    #[test]
    fn arrays_replace_whole() {
        let previous = json!({"containers": [{"name": "a", "resources": {"limits": {"cpu": "2"}}}]});
        let mut target = previous.clone();
        let desired = json!({"containers": [{"name": "a"}]});

        apply_owned(&mut target, Some(&previous), &desired);

        assert_eq!(target, desired);
    }

    #[test]
    fn first_apply_only_merges() {
        let mut target = json!({"status": {"ready": true}});
        apply_owned(&mut target, None, &json!({"spec": {"replicas": 3}}));
        assert_eq!(target, json!({"status": {"ready": true}, "spec": {"replicas": 3}}));
    }

    #[test]
    fn null_removes_key() {
        let mut target = json!({"a": 1, "b": 2});
        apply_merge_patch(&mut target, &json!({"b": null}));
        assert_eq!(target, json!({"a": 1}));
    }
}
