//! Custom Resource Definitions for Nimbus
//!
//! This module contains the CRD definitions used by the Nimbus operator
//! and the platform configuration entities shared with it.

mod config;
mod definition;
mod instance;
mod types;

pub use config::{InterfaceBindingPlugin, NetworkConfiguration, PlatformConfiguration};
pub use definition::{
    InstanceTemplateSpec, VirtualMachineDefinition, VirtualMachineDefinitionSpec,
    VirtualMachineDefinitionStatus,
};
pub use instance::{
    Devices, DomainSpec, Interface, InterfaceBinding, VirtualMachineInstance,
    VirtualMachineInstanceSpec, VirtualMachineInstanceStatus,
};
pub use types::{
    ConditionStatus, DefinitionCondition, DefinitionConditionType, InstanceCondition,
    InstanceConditionType, InstancePhase, LabelSelector, LabelSelectorOperator,
    LabelSelectorRequirement, TemplateMetadata,
};
