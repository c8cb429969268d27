//! Platform configuration entities
//!
//! The subset of the platform configuration the controllers consume:
//! the network binding plugin catalog mapping binding names to plugin
//! descriptors.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Platform-wide configuration for Nimbus components
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfiguration {
    /// Network-related configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_configuration: Option<NetworkConfiguration>,
}

/// Network configuration section of the platform configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfiguration {
    /// Catalog of network binding plugins, keyed by binding name.
    ///
    /// Interfaces on a VirtualMachineInstance reference entries of this
    /// catalog by name; a reference with no entry is a hard error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<BTreeMap<String, InterfaceBindingPlugin>>,
}

/// Descriptor of a network binding plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBindingPlugin {
    /// Container image of the sidecar this plugin requires next to the
    /// virtual machine launcher; empty or absent means no sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_image: Option<String>,

    /// NetworkAttachmentDefinition backing this binding, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_attachment_definition: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_deserializes_from_camel_case() {
        let raw = r#"{
            "networkConfiguration": {
                "binding": {
                    "bridged": {"sidecarImage": "registry.example/bridge-plugin:v1"},
                    "passt": {"networkAttachmentDefinition": "default/passt"}
                }
            }
        }"#;
        let config: PlatformConfiguration = serde_json::from_str(raw).unwrap();
        let catalog = config
            .network_configuration
            .unwrap()
            .binding
            .unwrap();
        assert_eq!(
            catalog["bridged"].sidecar_image.as_deref(),
            Some("registry.example/bridge-plugin:v1")
        );
        assert_eq!(catalog["passt"].sidecar_image, None);
    }

    #[test]
    fn test_empty_configuration_has_no_catalog() {
        let config = PlatformConfiguration::default();
        assert!(config.network_configuration.is_none());
    }
}
