//! VirtualMachineDefinition Custom Resource Definition
//!
//! A VirtualMachineDefinition (VMD) is the long-lived intent record for a
//! virtual machine: whether it should be running, and the template its
//! instance is stamped from. The controller keeps exactly one live
//! VirtualMachineInstance per running definition.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::instance::VirtualMachineInstanceSpec;
use super::types::{DefinitionCondition, DefinitionConditionType, LabelSelector, TemplateMetadata};

/// Specification for a VirtualMachineDefinition
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nimbus.dev",
    version = "v1alpha1",
    kind = "VirtualMachineDefinition",
    plural = "virtualmachinedefinitions",
    shortname = "vmd",
    status = "VirtualMachineDefinitionStatus",
    namespaced,
    printcolumn = r#"{"name":"Running","type":"boolean","jsonPath":".spec.running"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineDefinitionSpec {
    /// Desired power state: true means exactly one instance must run
    pub running: bool,

    /// Label selector defining this definition's claim on instances.
    ///
    /// Must match the template labels or the definition is invalid and
    /// will not be reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Template the child instance is created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<InstanceTemplateSpec>,
}

/// Template for the instance created by a definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplateSpec {
    /// Metadata stamped onto the created instance
    #[serde(default)]
    pub metadata: TemplateMetadata,

    /// Spec of the created instance
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

/// Status for a VirtualMachineDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineDefinitionStatus {
    /// Observed conditions; at most one entry per condition type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DefinitionCondition>,
}

impl VirtualMachineDefinition {
    /// Build the controller owner reference a child instance carries.
    ///
    /// The reference is marked `controller` and `blockOwnerDeletion` so
    /// garbage collection waits for the instance and other controllers
    /// refuse to adopt it.
    pub fn controller_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: VirtualMachineDefinition::api_version(&()).into_owned(),
            kind: VirtualMachineDefinition::kind(&()).into_owned(),
            name: self.name_any(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Check whether the status carries a condition of the given type.
    pub fn has_condition(&self, type_: DefinitionConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.iter().any(|c| c.type_ == type_))
    }

    /// The base name for a created instance: template name, then
    /// template generateName, then the definition's own name.
    pub fn instance_base_name(&self) -> String {
        if let Some(template) = &self.spec.template {
            if let Some(name) = &template.metadata.name {
                if !name.is_empty() {
                    return name.clone();
                }
            }
            if let Some(generate_name) = &template.metadata.generate_name {
                if !generate_name.is_empty() {
                    return generate_name.clone();
                }
            }
        }
        self.name_any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_definition(name: &str) -> VirtualMachineDefinition {
        VirtualMachineDefinition {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: VirtualMachineDefinitionSpec {
                running: true,
                selector: None,
                template: Some(InstanceTemplateSpec::default()),
            },
            status: None,
        }
    }

    #[test]
    fn test_controller_owner_reference_is_blocking_controller() {
        let definition = sample_definition("vm-a");
        let oref = definition.controller_owner_reference();
        assert_eq!(oref.api_version, "nimbus.dev/v1alpha1");
        assert_eq!(oref.kind, "VirtualMachineDefinition");
        assert_eq!(oref.name, "vm-a");
        assert_eq!(oref.uid, "uid-1");
        assert_eq!(oref.controller, Some(true));
        assert_eq!(oref.block_owner_deletion, Some(true));
    }

    #[test]
    fn test_instance_base_name_precedence() {
        let mut definition = sample_definition("vm-a");
        assert_eq!(definition.instance_base_name(), "vm-a");

        let template = definition.spec.template.as_mut().unwrap();
        template.metadata.generate_name = Some("vm-gen-".to_string());
        assert_eq!(definition.instance_base_name(), "vm-gen-");

        let template = definition.spec.template.as_mut().unwrap();
        template.metadata.name = Some("vm-explicit".to_string());
        assert_eq!(definition.instance_base_name(), "vm-explicit");
    }

    #[test]
    fn test_has_condition() {
        let mut definition = sample_definition("vm-a");
        assert!(!definition.has_condition(DefinitionConditionType::Running));

        definition.status = Some(VirtualMachineDefinitionStatus {
            conditions: vec![DefinitionCondition::new(
                DefinitionConditionType::Running,
                ConditionStatus::True,
                "Started",
                "instance is running",
            )],
        });
        assert!(definition.has_condition(DefinitionConditionType::Running));
        assert!(!definition.has_condition(DefinitionConditionType::Failure));
    }

    #[test]
    fn test_spec_round_trips_camel_case() {
        let definition = sample_definition("vm-a");
        let json = serde_json::to_value(&definition.spec).unwrap();
        assert_eq!(json["running"], true);
        assert!(json.get("template").is_some());
    }
}
