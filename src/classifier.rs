//! Worker-pool classification predicates
//!
//! Pure, total functions over loosely typed Machine API objects. Absent
//! fields are a normal state for new or provider-specific objects, so every
//! predicate answers `false` rather than failing.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

use crate::resource::{NestedFields, SPEC_TEMPLATE_LABELS, STATUS_AVAILABLE_REPLICAS};
use crate::{MACHINE_ROLE_LABEL, WORKER_ROLE};

/// True only if the MachineSet's pod-template role label is exactly `worker`.
pub fn is_worker_machine_set(machine_set: &DynamicObject) -> bool {
    machine_set
        .nested(SPEC_TEMPLATE_LABELS)
        .and_then(|labels| labels.get(MACHINE_ROLE_LABEL))
        .and_then(Value::as_str)
        == Some(WORKER_ROLE)
}

/// True iff `status.availableReplicas` is present and at least one.
pub fn has_nodes_available(machine_set: &DynamicObject) -> bool {
    machine_set
        .nested_i64(STATUS_AVAILABLE_REPLICAS)
        .is_some_and(|available| available > 0)
}

/// Machines carry the role label from their MachineSet template on their own
/// metadata. A missing label is treated as "possibly worker": the MachineSet
/// reconciler classifies the parent again before acting.
pub fn is_worker_machine(machine: &DynamicObject) -> bool {
    machine
        .labels()
        .get(MACHINE_ROLE_LABEL)
        .map_or(true, |role| role == WORKER_ROLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::set_nested;
    use kube::discovery::ApiResource;
    use serde_json::json;

    fn ar(kind: &str, plural: &str) -> ApiResource {
        ApiResource {
            group: "machine.openshift.io".to_string(),
            version: "v1beta1".to_string(),
            api_version: "machine.openshift.io/v1beta1".to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    fn machine_set(data: Value) -> DynamicObject {
        DynamicObject::new("ms", &ar("MachineSet", "machinesets")).data(data)
    }

    fn machine_with_labels(labels: &[(&str, &str)]) -> DynamicObject {
        let mut m = DynamicObject::new("m", &ar("Machine", "machines"));
        for (k, v) in labels {
            m.labels_mut().insert(k.to_string(), v.to_string());
        }
        m
    }

    #[test]
    fn test_empty_machine_set_is_not_worker() {
        assert!(!is_worker_machine_set(&machine_set(Value::Null)));
        assert!(!is_worker_machine_set(&machine_set(json!({}))));
    }

    #[test]
    fn test_partial_paths_are_not_worker() {
        for data in [
            json!({"spec": {}}),
            json!({"spec": {"template": {}}}),
            json!({"spec": {"template": {"metadata": {}}}}),
            json!({"spec": {"template": {"metadata": {"labels": {}}}}}),
            json!({"spec": {"template": null}}),
            json!({"spec": "not-an-object"}),
        ] {
            assert!(!is_worker_machine_set(&machine_set(data.clone())), "{data}");
        }
    }

    #[test]
    fn test_worker_label_marks_worker() {
        let ms = machine_set(json!({
            "spec": {"template": {"metadata": {"labels": {MACHINE_ROLE_LABEL: "worker"}}}}
        }));
        assert!(is_worker_machine_set(&ms));
    }

    #[test]
    fn test_other_roles_and_non_strings_are_not_worker() {
        for role in [json!("infra"), json!("master"), json!("Worker"), json!(""), json!(1)] {
            let ms = machine_set(json!({
                "spec": {"template": {"metadata": {"labels": {MACHINE_ROLE_LABEL: role}}}}
            }));
            assert!(!is_worker_machine_set(&ms));
        }
    }

    #[test]
    fn test_worker_label_written_at_template_labels_path_marks_worker() {
        let mut ms = machine_set(json!({"spec": {"replicas": 2}}));
        set_nested(
            &mut ms.data,
            SPEC_TEMPLATE_LABELS,
            json!({MACHINE_ROLE_LABEL: "worker", "team": "batch"}),
        );
        set_nested(&mut ms.data, STATUS_AVAILABLE_REPLICAS, json!(2));
        assert!(is_worker_machine_set(&ms));
        assert!(has_nodes_available(&ms));

        set_nested(&mut ms.data, SPEC_TEMPLATE_LABELS, json!(["worker"]));
        assert!(!is_worker_machine_set(&ms));
    }

    #[test]
    fn test_worker_label_on_object_metadata_is_not_enough() {
        // Only the pod-template label classifies the pool
        let mut ms = machine_set(json!({"spec": {"replicas": 1}}));
        ms.labels_mut()
            .insert(MACHINE_ROLE_LABEL.to_string(), "worker".to_string());
        assert!(!is_worker_machine_set(&ms));
    }

    #[test]
    fn test_missing_status_has_no_nodes() {
        assert!(!has_nodes_available(&machine_set(Value::Null)));
        assert!(!has_nodes_available(&machine_set(json!({"status": {}}))));
    }

    #[test]
    fn test_non_positive_counts_have_no_nodes() {
        for n in [0, -1, i64::MIN] {
            let ms = machine_set(json!({"status": {"availableReplicas": n}}));
            assert!(!has_nodes_available(&ms), "{n}");
        }
    }

    #[test]
    fn test_positive_counts_have_nodes() {
        for n in [1, 2, 50] {
            let ms = machine_set(json!({"status": {"availableReplicas": n}}));
            assert!(has_nodes_available(&ms), "{n}");
        }
    }

    #[test]
    fn test_non_integer_counts_have_no_nodes() {
        for v in [json!("1"), json!(1.5), json!(null), json!(true)] {
            let ms = machine_set(json!({"status": {"availableReplicas": v}}));
            assert!(!has_nodes_available(&ms));
        }
    }

    #[test]
    fn test_worker_without_status_scenario() {
        let ms = machine_set(json!({
            "spec": {"template": {"metadata": {"labels": {MACHINE_ROLE_LABEL: "worker"}}}}
        }));
        assert!(is_worker_machine_set(&ms));
        assert!(!has_nodes_available(&ms));
    }

    #[test]
    fn test_machine_role_classification() {
        assert!(is_worker_machine(&machine_with_labels(&[])));
        assert!(is_worker_machine(&machine_with_labels(&[(
            MACHINE_ROLE_LABEL,
            "worker"
        )])));
        assert!(!is_worker_machine(&machine_with_labels(&[(
            MACHINE_ROLE_LABEL,
            "infra"
        )])));
    }
}
