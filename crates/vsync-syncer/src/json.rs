//! JSON merge patch (RFC 7386) helpers, list-aware merges and JSON-pointer edits.
//!
//! Applying merge patches is `json_patch::merge`; pointer edits go through
//! `jsonptr`. Generating a merge patch and the three-way list merges below
//! have no counterpart in either crate.

use std::collections::BTreeSet;

use jsonptr::Pointer;
use serde_json::{json, Map, Value};
use vsync_common::{Error, Result};

/// Compute the merge patch turning `before` into `after`
///
/// Keys missing from `after` become `null`. Objects are diffed recursively;
/// any other differing value (including arrays) is replaced wholesale.
pub fn create_merge_patch(before: &Value, after: &Value) -> Value {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for (key, old) in b {
                match a.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) if new != old => {
                        let value = match (old, new) {
                            (Value::Object(_), Value::Object(_)) => create_merge_patch(old, new),
                            _ => new.clone(),
                        };
                        patch.insert(key.clone(), value);
                    }
                    Some(_) => {}
                }
            }
            for (key, new) in a {
                if !b.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            Value::Object(patch)
        }
        _ => after.clone(),
    }
}

/// Apply a merge patch in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    json_patch::merge(target, patch);
}

/// Add a `metadata.resourceVersion` precondition to a merge patch
pub fn set_resource_version(patch: &mut Value, resource_version: &str) {
    json_patch::merge(
        patch,
        &json!({ "metadata": { "resourceVersion": resource_version } }),
    );
}

/// Lay `desired` over `target`, keeping what only `target` has
///
/// Lists of objects keyed by a unique `name` merge per name, so entries the
/// host injected (sidecars, extra env) survive. Other lists of objects merge
/// item by item when their lengths match, otherwise missing items are
/// appended. Lists of scalars follow `desired`.
pub fn overlay(target: &mut Value, desired: &Value) {
    match (target, desired) {
        (Value::Object(t), Value::Object(d)) => {
            for (key, value) in d {
                if value.is_null() {
                    t.remove(key);
                    continue;
                }
                match t.get_mut(key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        t.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(t), Value::Array(d)) => overlay_list(t, d),
        (target, desired) => *target = desired.clone(),
    }
}

fn overlay_list(target: &mut Vec<Value>, desired: &[Value]) {
    if is_named(target) && is_named(desired) {
        for item in desired {
            match find_named(target, item_name(item)) {
                Some(existing) => overlay(existing, item),
                None => target.push(item.clone()),
            }
        }
    } else if target.len() == desired.len() {
        for (existing, value) in target.iter_mut().zip(desired) {
            overlay(existing, value);
        }
    } else if all_objects(target) && all_objects(desired) {
        for item in desired {
            if !target.iter().any(|existing| covers(existing, item)) {
                target.push(item.clone());
            }
        }
    } else {
        *target = desired.to_vec();
    }
}

/// Replay the change `before → after` onto `target`
///
/// Structural three-way merge: keys dropped between `before` and `after` are
/// removed from `target`, changed values are rewritten, and list entries
/// removed or added between `before` and `after` are removed from or added
/// to `target`, leaving entries only `target` carries in place.
pub fn replay(target: &mut Value, before: &Value, after: &Value) {
    match (target, before, after) {
        (Value::Object(t), Value::Object(b), Value::Object(a)) => {
            for key in b.keys() {
                if !a.contains_key(key) {
                    t.remove(key);
                }
            }
            for (key, new) in a {
                match (t.get_mut(key), b.get(key)) {
                    (Some(existing), Some(old)) => replay(existing, old, new),
                    (Some(_), None) => {}
                    (None, _) => {
                        t.insert(key.clone(), new.clone());
                    }
                }
            }
        }
        (Value::Array(t), Value::Array(b), Value::Array(a)) => replay_list(t, b, a),
        (target, before, after) => {
            if before != after {
                *target = after.clone();
            }
        }
    }
}

fn replay_list(target: &mut Vec<Value>, before: &[Value], after: &[Value]) {
    if before == after {
        return;
    }
    if is_named(target) && is_named(before) && is_named(after) {
        let removed: BTreeSet<&str> = before
            .iter()
            .map(item_name)
            .filter(|name| !after.iter().any(|item| item_name(item) == *name))
            .collect();
        target.retain(|existing| !removed.contains(item_name(existing)));
        for item in after {
            let name = item_name(item);
            let old = before.iter().find(|old| item_name(old) == name);
            if let Some(existing) = find_named(target, name) {
                if let Some(old) = old {
                    replay(existing, old, item);
                }
            } else {
                target.push(item.clone());
            }
        }
    } else if target.len() == after.len() && before.len() == after.len() {
        for ((existing, old), new) in target.iter_mut().zip(before).zip(after) {
            replay(existing, old, new);
        }
    } else if all_objects(target) && all_objects(before) && all_objects(after) {
        let removed: Vec<&Value> = before.iter().filter(|old| !after.contains(*old)).collect();
        target.retain(|existing| !removed.iter().any(|old| covers(existing, *old)));
        for item in after {
            if !before.contains(item) && !target.iter().any(|existing| covers(existing, item)) {
                target.push(item.clone());
            }
        }
    } else {
        *target = after.to_vec();
    }
}

/// Whether every entry is an object with a `name` no other entry shares
fn is_named(items: &[Value]) -> bool {
    let mut names = BTreeSet::new();
    items.iter().all(|item| {
        item.get("name")
            .and_then(Value::as_str)
            .is_some_and(|name| names.insert(name))
    })
}

fn item_name(item: &Value) -> &str {
    item.get("name").and_then(Value::as_str).unwrap_or_default()
}

fn find_named<'a>(items: &'a mut [Value], name: &str) -> Option<&'a mut Value> {
    items.iter_mut().find(|item| item_name(item) == name)
}

fn all_objects(items: &[Value]) -> bool {
    items.iter().all(Value::is_object)
}

/// Whether overlaying `desired` onto `target` would change nothing
fn covers(target: &Value, desired: &Value) -> bool {
    match (target, desired) {
        (Value::Object(t), Value::Object(d)) => d
            .iter()
            .all(|(key, value)| value.is_null() || t.get(key).is_some_and(|e| covers(e, value))),
        (Value::Array(t), Value::Array(d)) => {
            t.len() == d.len() && t.iter().zip(d).all(|(e, v)| covers(e, v))
        }
        _ => target == desired,
    }
}

/// Whether a patch would change nothing
pub fn is_empty_patch(patch: &Value) -> bool {
    match patch {
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Remove the value at a JSON pointer, returning it
pub fn remove_pointer(value: &mut Value, pointer: &str) -> Option<Value> {
    Pointer::parse(pointer).ok()?.delete(value)
}

/// Set the value at a JSON pointer, creating intermediate objects
pub fn set_pointer(value: &mut Value, pointer: &str, new: Value) -> Result<()> {
    let ptr = Pointer::parse(pointer)
        .map_err(|e| Error::serialization(format!("invalid pointer {pointer}: {e}")))?;
    ptr.assign(value, new)
        .map_err(|e| Error::serialization(format!("cannot set {pointer}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_records_additions_changes_and_removals() {
        let before = json!({"spec": {"a": 1, "b": {"c": 2}, "gone": true}, "keep": "x"});
        let after = json!({"spec": {"a": 2, "b": {"c": 2, "d": 3}}, "keep": "x"});
        let patch = create_merge_patch(&before, &after);
        assert_eq!(
            patch,
            json!({"spec": {"a": 2, "b": {"d": 3}, "gone": null}})
        );

        let mut applied = before.clone();
        apply_merge_patch(&mut applied, &patch);
        assert_eq!(applied, after);
    }

    #[test]
    fn identical_values_produce_empty_patch() {
        let v = json!({"a": [1, 2], "b": {"c": null}});
        assert!(is_empty_patch(&create_merge_patch(&v, &v)));
    }

    #[test]
    fn arrays_are_replaced_by_merge_patch() {
        let patch = create_merge_patch(&json!({"a": [1, 2]}), &json!({"a": [1]}));
        assert_eq!(patch, json!({"a": [1]}));
    }

    #[test]
    fn resource_version_precondition_is_merged_in() {
        let mut patch = json!({"metadata": {"labels": {"a": "b"}}});
        set_resource_version(&mut patch, "42");
        assert_eq!(
            patch,
            json!({"metadata": {"labels": {"a": "b"}, "resourceVersion": "42"}})
        );
    }

    #[test]
    fn overlay_keeps_defaulted_fields_inside_lists() {
        let mut host = json!({
            "spec": {
                "containers": [{"name": "app", "image": "nginx:1", "terminationMessagePath": "/dev/termination-log"}],
                "schedulerName": "default-scheduler"
            }
        });
        let desired = json!({"spec": {"containers": [{"name": "app", "image": "nginx:2"}]}});
        overlay(&mut host, &desired);
        assert_eq!(host["spec"]["containers"][0]["image"], "nginx:2");
        assert_eq!(
            host["spec"]["containers"][0]["terminationMessagePath"],
            "/dev/termination-log"
        );
        assert_eq!(host["spec"]["schedulerName"], "default-scheduler");
    }

    #[test]
    fn overlay_keeps_host_injected_named_entries() {
        let mut host = json!({"containers": [
            {"name": "app", "image": "nginx:1"},
            {"name": "istio-proxy", "image": "proxyv2"}
        ]});
        overlay(&mut host, &json!({"containers": [{"name": "app", "image": "nginx:2"}]}));
        assert_eq!(
            host,
            json!({"containers": [
                {"name": "app", "image": "nginx:2"},
                {"name": "istio-proxy", "image": "proxyv2"}
            ]})
        );
    }

    #[test]
    fn overlay_appends_missing_items_without_dropping_defaults() {
        let mut host = json!({"ports": [{"port": 80, "protocol": "TCP"}]});
        overlay(&mut host, &json!({"ports": [{"port": 80}, {"port": 443}]}));
        assert_eq!(host, json!({"ports": [{"port": 80, "protocol": "TCP"}, {"port": 443}]}));
    }

    #[test]
    fn overlay_replaces_scalar_lists() {
        let mut host = json!({"args": ["--a", "1"]});
        overlay(&mut host, &json!({"args": ["--a", "1", "--b"]}));
        assert_eq!(host, json!({"args": ["--a", "1", "--b"]}));
    }

    #[test]
    fn replay_applies_virtual_change_without_losing_host_fields() {
        let before = json!({"containers": [{"name": "app", "image": "nginx:1"}], "env": "a", "gone": 1});
        let after = json!({"containers": [{"name": "app", "image": "nginx:2"}], "env": "a"});
        let mut host = json!({
            "containers": [{"name": "app", "image": "nginx:1", "imagePullPolicy": "IfNotPresent"}],
            "env": "host-override",
            "gone": 1,
            "dnsPolicy": "ClusterFirst"
        });
        replay(&mut host, &before, &after);
        assert_eq!(
            host,
            json!({
                "containers": [{"name": "app", "image": "nginx:2", "imagePullPolicy": "IfNotPresent"}],
                "env": "host-override",
                "dnsPolicy": "ClusterFirst"
            })
        );
    }

    #[test]
    fn replay_removes_virtually_deleted_named_entries_only() {
        let before = json!({"env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]});
        let after = json!({"env": [{"name": "A", "value": "1"}]});
        let mut host = json!({"env": [
            {"name": "A", "value": "1"},
            {"name": "B", "value": "2"},
            {"name": "INJECTED", "value": "x"}
        ]});
        replay(&mut host, &before, &after);
        assert_eq!(
            host,
            json!({"env": [{"name": "A", "value": "1"}, {"name": "INJECTED", "value": "x"}]})
        );
    }

    #[test]
    fn replay_keeps_admission_added_tolerations() {
        let added = json!({"key": "node.kubernetes.io/not-ready", "operator": "Exists", "effect": "NoExecute", "tolerationSeconds": 300});
        let before = json!({"tolerations": [{"key": "gpu", "operator": "Exists"}]});
        let after = json!({"tolerations": [{"key": "spot", "operator": "Exists"}]});
        let mut host = json!({"tolerations": [{"key": "gpu", "operator": "Exists"}, added.clone()]});
        replay(&mut host, &before, &after);
        assert_eq!(
            host,
            json!({"tolerations": [added, {"key": "spot", "operator": "Exists"}]})
        );
    }

    #[test]
    fn pointer_edits() {
        let mut v = json!({"spec": {"clusterIP": "10.0.0.1", "a/b": 1}});
        assert_eq!(remove_pointer(&mut v, "/spec/clusterIP"), Some(json!("10.0.0.1")));
        assert_eq!(remove_pointer(&mut v, "/spec/a~1b"), Some(json!(1)));
        assert_eq!(remove_pointer(&mut v, "/spec/missing"), None);
        assert_eq!(remove_pointer(&mut v, "/nothing/here"), None);

        set_pointer(&mut v, "/spec/nodeName", json!("node-1")).unwrap();
        set_pointer(&mut v, "/status/phase", json!("Running")).unwrap();
        assert_eq!(v, json!({"spec": {"nodeName": "node-1"}, "status": {"phase": "Running"}}));
    }

    #[test]
    fn set_pointer_replaces_whole_maps() {
        let mut v = json!({"spec": {"selector": {"old": "x"}}});
        set_pointer(&mut v, "/spec/selector", json!({"new": "y"})).unwrap();
        assert_eq!(v, json!({"spec": {"selector": {"new": "y"}}}));
        assert!(set_pointer(&mut v, "no-slash", json!(1)).is_err());
    }
}
