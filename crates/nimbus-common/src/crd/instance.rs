//! VirtualMachineInstance Custom Resource Definition
//!
//! A VirtualMachineInstance (VMI) is the ephemeral record of an actually
//! running virtual machine. Instances are created and deleted by the
//! definition controller; node-level subsystems drive their phase.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionStatus, InstanceCondition, InstanceConditionType, InstancePhase};

/// Specification for a VirtualMachineInstance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nimbus.dev",
    version = "v1alpha1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    shortname = "vmi",
    status = "VirtualMachineInstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// The virtual machine domain: devices and their wiring
    pub domain: DomainSpec,
}

/// The domain of a virtual machine instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// Devices attached to the virtual machine
    #[serde(default)]
    pub devices: Devices,
}

/// Devices attached to a virtual machine domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Network interfaces of the virtual machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

/// A network interface declared on a virtual machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Logical name of the interface, unique within the instance
    pub name: String,

    /// Network binding plugin wiring this interface, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<InterfaceBinding>,
}

/// Reference to a network binding plugin by catalog name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBinding {
    /// Name of the binding in the platform configuration catalog
    pub name: String,
}

/// Status for a VirtualMachineInstance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: InstancePhase,

    /// Detailed conditions reported by the node-level subsystems
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<InstanceCondition>,
}

impl VirtualMachineInstance {
    /// Terminal instances cannot transition back to running and are
    /// invisible to the definition controller's scaling decisions.
    pub fn is_final(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase.is_final())
    }

    /// An instance is ready when its `Ready` condition is true.
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions.iter().any(|c| {
                c.type_ == InstanceConditionType::Ready && c.status == ConditionStatus::True
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_with_phase(phase: InstancePhase) -> VirtualMachineInstance {
        let mut instance = VirtualMachineInstance::new(
            "vm-a",
            VirtualMachineInstanceSpec::default(),
        );
        instance.status = Some(VirtualMachineInstanceStatus {
            phase,
            conditions: vec![],
        });
        instance
    }

    #[test]
    fn test_is_final_tracks_terminal_phases() {
        assert!(instance_with_phase(InstancePhase::Succeeded).is_final());
        assert!(instance_with_phase(InstancePhase::Failed).is_final());
        assert!(!instance_with_phase(InstancePhase::Running).is_final());
        assert!(!instance_with_phase(InstancePhase::Pending).is_final());
    }

    #[test]
    fn test_instance_without_status_is_not_final() {
        let instance =
            VirtualMachineInstance::new("vm-a", VirtualMachineInstanceSpec::default());
        assert!(!instance.is_final());
        assert!(!instance.is_ready());
    }

    #[test]
    fn test_is_ready_requires_true_ready_condition() {
        let mut instance = instance_with_phase(InstancePhase::Running);
        assert!(!instance.is_ready());

        instance.status.as_mut().unwrap().conditions.push(InstanceCondition {
            type_: InstanceConditionType::Ready,
            status: ConditionStatus::False,
            reason: None,
            message: None,
            last_transition_time: None,
        });
        assert!(!instance.is_ready());

        instance.status.as_mut().unwrap().conditions[0].status = ConditionStatus::True;
        assert!(instance.is_ready());
    }

    #[test]
    fn test_spec_serializes_interfaces_camel_case() {
        let spec = VirtualMachineInstanceSpec {
            domain: DomainSpec {
                devices: Devices {
                    interfaces: vec![Interface {
                        name: "default".to_string(),
                        binding: Some(InterfaceBinding {
                            name: "bridged".to_string(),
                        }),
                    }],
                },
            },
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            json["domain"]["devices"]["interfaces"][0]["binding"]["name"],
            "bridged"
        );
    }
}
