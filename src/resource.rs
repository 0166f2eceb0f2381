//! Safe nested access to loosely typed Machine API objects
//!
//! MachineSets and Machines are handled as [`DynamicObject`]s because their
//! schema varies by provider and freshly created objects are often only
//! partially populated. Every read here returns `Option` per path segment so
//! callers never have to validate shape first.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};

use crate::LAST_RECONCILED_ANNOTATION;

/// Path to the declared replica count on a MachineSet
pub const SPEC_REPLICAS: &[&str] = &["spec", "replicas"];

/// Path to the labels stamped onto Machines created from a MachineSet
pub const SPEC_TEMPLATE_LABELS: &[&str] = &["spec", "template", "metadata", "labels"];

/// Path to the available replica count on a MachineSet
pub const STATUS_AVAILABLE_REPLICAS: &[&str] = &["status", "availableReplicas"];

/// Path to a Machine's lifecycle phase
pub const STATUS_PHASE: &[&str] = &["status", "phase"];

/// Optional lookup along a path of object keys
pub trait NestedFields {
    /// Value at `path`, or `None` if any segment is missing or not an object
    fn nested(&self, path: &[&str]) -> Option<&Value>;

    /// String at `path`
    fn nested_str(&self, path: &[&str]) -> Option<&str> {
        self.nested(path).and_then(Value::as_str)
    }

    /// Integer at `path`; floats and strings are not coerced
    fn nested_i64(&self, path: &[&str]) -> Option<i64> {
        self.nested(path).and_then(Value::as_i64)
    }
}

impl NestedFields for Value {
    fn nested(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(self, |current, segment| current.as_object()?.get(*segment))
    }
}

impl NestedFields for DynamicObject {
    fn nested(&self, path: &[&str]) -> Option<&Value> {
        self.data.nested(path)
    }
}

/// Set `value` at `path`, creating intermediate objects.
///
/// Non-object intermediates (including a `null` root) are replaced with
/// empty objects.
pub fn set_nested(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

/// `namespace/name` key used for logging and per-object bookkeeping
pub fn object_key(obj: &DynamicObject) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Declared (`spec.replicas`) count
pub fn declared_replicas(machine_set: &DynamicObject) -> Option<i64> {
    machine_set.nested_i64(SPEC_REPLICAS)
}

/// Available (`status.availableReplicas`) count
pub fn available_replicas(machine_set: &DynamicObject) -> Option<i64> {
    machine_set.nested_i64(STATUS_AVAILABLE_REPLICAS)
}

/// State of the controller-owned last-reconciled marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastReconciled {
    /// Never written: first observation of this MachineSet
    Unset,
    /// Last replica count this controller reconciled to
    Value(i64),
    /// Present but not a decimal integer
    Invalid(String),
}

impl LastReconciled {
    /// Parsed value, if any
    pub fn value(&self) -> Option<i64> {
        match self {
            LastReconciled::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// Read the last-reconciled marker annotation
pub fn last_reconciled_replicas(machine_set: &DynamicObject) -> LastReconciled {
    match machine_set.annotations().get(LAST_RECONCILED_ANNOTATION) {
        None => LastReconciled::Unset,
        Some(raw) => match raw.trim().parse::<i64>() {
            Ok(v) => LastReconciled::Value(v),
            Err(_) => LastReconciled::Invalid(raw.clone()),
        },
    }
}

/// Overwrite `spec.replicas`
pub fn set_declared_replicas(machine_set: &mut DynamicObject, replicas: i64) {
    set_nested(&mut machine_set.data, SPEC_REPLICAS, Value::from(replicas));
}

/// Overwrite the last-reconciled marker annotation
pub fn set_last_reconciled_replicas(machine_set: &mut DynamicObject, replicas: i64) {
    machine_set
        .annotations_mut()
        .insert(LAST_RECONCILED_ANNOTATION.to_string(), replicas.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::discovery::ApiResource;
    use serde_json::json;

    fn machine_set(data: Value) -> DynamicObject {
        let ar = ApiResource {
            group: "machine.openshift.io".to_string(),
            version: "v1beta1".to_string(),
            api_version: "machine.openshift.io/v1beta1".to_string(),
            kind: "MachineSet".to_string(),
            plural: "machinesets".to_string(),
        };
        DynamicObject::new("workers-a", &ar)
            .within("openshift-machine-api")
            .data(data)
    }

    #[test]
    fn test_nested_lookup_walks_objects() {
        let v = json!({"a": {"b": {"c": 3}}});
        assert_eq!(v.nested_i64(&["a", "b", "c"]), Some(3));
        assert_eq!(v.nested(&["a", "x"]), None);
    }

    #[test]
    fn test_nested_lookup_stops_at_non_objects() {
        let v = json!({"a": [1, 2, 3], "s": "text"});
        assert_eq!(v.nested(&["a", "0"]), None);
        assert_eq!(v.nested(&["s", "len"]), None);
        assert_eq!(Value::Null.nested(&["anything"]), None);
    }

    #[test]
    fn test_empty_path_returns_root() {
        let v = json!({"a": 1});
        assert_eq!(v.nested(&[]), Some(&v));
    }

    #[test]
    fn test_typed_reads_do_not_coerce() {
        let v = json!({"n": "5", "f": 1.5, "s": 7});
        assert_eq!(v.nested_i64(&["n"]), None);
        assert_eq!(v.nested_i64(&["f"]), None);
        assert_eq!(v.nested_str(&["s"]), None);
    }

    #[test]
    fn test_set_nested_creates_parents_on_null_root() {
        let mut v = Value::Null;
        set_nested(&mut v, &["spec", "replicas"], json!(4));
        assert_eq!(v, json!({"spec": {"replicas": 4}}));
    }

    #[test]
    fn test_set_nested_preserves_siblings_and_replaces_scalars() {
        let mut v = json!({"spec": {"replicas": 1, "selector": {}}, "status": 3});
        set_nested(&mut v, &["spec", "replicas"], json!(2));
        set_nested(&mut v, &["status", "availableReplicas"], json!(1));
        assert_eq!(
            v,
            json!({"spec": {"replicas": 2, "selector": {}}, "status": {"availableReplicas": 1}})
        );
    }

    #[test]
    fn test_replica_accessors_read_spec_and_status() {
        let ms = machine_set(json!({"spec": {"replicas": 3}, "status": {"availableReplicas": 2}}));
        assert_eq!(declared_replicas(&ms), Some(3));
        assert_eq!(available_replicas(&ms), Some(2));

        let empty = machine_set(Value::Null);
        assert_eq!(declared_replicas(&empty), None);
        assert_eq!(available_replicas(&empty), None);
    }

    #[test]
    fn test_marker_round_trips_through_annotation() {
        let mut ms = machine_set(json!({"spec": {"replicas": 3}}));
        assert_eq!(last_reconciled_replicas(&ms), LastReconciled::Unset);

        set_last_reconciled_replicas(&mut ms, 3);
        assert_eq!(last_reconciled_replicas(&ms), LastReconciled::Value(3));
        assert_eq!(last_reconciled_replicas(&ms).value(), Some(3));
    }

    #[test]
    fn test_invalid_marker_is_reported() {
        let mut ms = machine_set(json!({}));
        ms.annotations_mut()
            .insert(LAST_RECONCILED_ANNOTATION.to_string(), "three".to_string());
        assert_eq!(
            last_reconciled_replicas(&ms),
            LastReconciled::Invalid("three".to_string())
        );
        assert_eq!(last_reconciled_replicas(&ms).value(), None);
    }

    #[test]
    fn test_object_key_includes_namespace() {
        let ms = machine_set(json!({}));
        assert_eq!(object_key(&ms), "openshift-machine-api/workers-a");
    }

    #[test]
    fn test_set_declared_replicas_on_sparse_object() {
        let mut ms = machine_set(Value::Null);
        set_declared_replicas(&mut ms, 5);
        assert_eq!(declared_replicas(&ms), Some(5));
    }
}
