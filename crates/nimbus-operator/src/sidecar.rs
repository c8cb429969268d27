//! Network binding plugin sidecar resolution
//!
//! Interfaces on a VirtualMachineInstance may be wired through a named
//! network binding plugin. Each plugin can require a sidecar container
//! next to the launcher; this module computes the set of sidecar images
//! an instance needs from the platform configuration's binding catalog.

use std::collections::BTreeMap;

use nimbus_common::crd::{
    InterfaceBindingPlugin, PlatformConfiguration, VirtualMachineInstance,
};
use nimbus_common::Error;

/// A sidecar container required by a network binding plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginSidecar {
    /// Container image of the sidecar.
    pub image: String,
}

/// Compute the sidecars required by the instance's declared bindings.
///
/// Bindings are de-duplicated by name, so two interfaces sharing a
/// binding yield one sidecar. A binding name absent from the catalog is
/// a hard error; an entry without a sidecar image contributes nothing.
pub fn net_binding_plugin_sidecars(
    instance: &VirtualMachineInstance,
    config: &PlatformConfiguration,
) -> Result<Vec<PluginSidecar>, Error> {
    let catalog = config
        .network_configuration
        .as_ref()
        .and_then(|n| n.binding.as_ref());

    let mut by_name: BTreeMap<&str, &InterfaceBindingPlugin> = BTreeMap::new();
    for interface in &instance.spec.domain.devices.interfaces {
        let Some(binding) = &interface.binding else {
            continue;
        };
        match catalog.and_then(|c| c.get(&binding.name)) {
            Some(plugin) => {
                by_name.insert(&binding.name, plugin);
            }
            None => {
                return Err(Error::validation(format!(
                    "couldn't find configuration for network binding: {}",
                    binding.name
                )));
            }
        }
    }

    Ok(by_name
        .values()
        .filter_map(|plugin| {
            plugin
                .sidecar_image
                .as_deref()
                .filter(|image| !image.is_empty())
                .map(|image| PluginSidecar {
                    image: image.to_string(),
                })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use nimbus_common::crd::{
        Devices, DomainSpec, Interface, InterfaceBinding, NetworkConfiguration,
        VirtualMachineInstanceSpec,
    };

    fn instance_with_bindings(bindings: &[Option<&str>]) -> VirtualMachineInstance {
        let interfaces = bindings
            .iter()
            .enumerate()
            .map(|(i, binding)| Interface {
                name: format!("net{i}"),
                binding: binding.map(|name| InterfaceBinding {
                    name: name.to_string(),
                }),
            })
            .collect();
        VirtualMachineInstance::new(
            "vm-a",
            VirtualMachineInstanceSpec {
                domain: DomainSpec {
                    devices: Devices { interfaces },
                },
            },
        )
    }

    fn config_with_catalog(entries: &[(&str, &str)]) -> PlatformConfiguration {
        let binding = entries
            .iter()
            .map(|(name, image)| {
                (
                    name.to_string(),
                    InterfaceBindingPlugin {
                        sidecar_image: if image.is_empty() {
                            Some(String::new())
                        } else {
                            Some(image.to_string())
                        },
                        network_attachment_definition: None,
                    },
                )
            })
            .collect();
        PlatformConfiguration {
            network_configuration: Some(NetworkConfiguration {
                binding: Some(binding),
            }),
        }
    }

    #[test]
    fn emits_one_sidecar_per_plugin_with_an_image() {
        let instance = instance_with_bindings(&[Some("bind-a"), Some("bind-b")]);
        let config = config_with_catalog(&[("bind-a", "img-a"), ("bind-b", "")]);

        let sidecars = net_binding_plugin_sidecars(&instance, &config).unwrap();
        assert_eq!(
            sidecars,
            vec![PluginSidecar {
                image: "img-a".to_string()
            }]
        );
    }

    #[test]
    fn unknown_binding_is_a_hard_error_naming_the_binding() {
        let instance = instance_with_bindings(&[Some("bind-a"), Some("bind-b")]);
        let config = config_with_catalog(&[("bind-a", "img-a")]);

        let err = net_binding_plugin_sidecars(&instance, &config).unwrap_err();
        assert!(err.to_string().contains("bind-b"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_catalog_with_bindings_is_a_hard_error() {
        let instance = instance_with_bindings(&[Some("bind-a")]);
        let config = PlatformConfiguration::default();

        assert!(net_binding_plugin_sidecars(&instance, &config).is_err());
    }

    #[test]
    fn interfaces_without_bindings_need_no_catalog() {
        let instance = instance_with_bindings(&[None, None]);
        let config = PlatformConfiguration::default();

        let sidecars = net_binding_plugin_sidecars(&instance, &config).unwrap();
        assert!(sidecars.is_empty());
    }

    #[test]
    fn shared_binding_is_deduplicated_by_name() {
        let instance = instance_with_bindings(&[Some("bind-a"), Some("bind-a")]);
        let config = config_with_catalog(&[("bind-a", "img-a")]);

        let sidecars = net_binding_plugin_sidecars(&instance, &config).unwrap();
        assert_eq!(sidecars.len(), 1);
    }

    #[test]
    fn no_interfaces_yield_no_sidecars() {
        let instance = instance_with_bindings(&[]);
        let config = config_with_catalog(&[("bind-a", "img-a")]);

        assert!(net_binding_plugin_sidecars(&instance, &config)
            .unwrap()
            .is_empty());
    }
}
