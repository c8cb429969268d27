//! Seams to the outside world: informer caches and the API client
//!
//! The informer caches own every cached snapshot; the controller only
//! holds read-only references for the duration of a reconcile call. The
//! traits here allow mocking both the caches and the typed API client
//! in tests while using reflector stores and `kube::Api` in production.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use nimbus_common::crd::{VirtualMachineDefinition, VirtualMachineInstance};
use nimbus_common::Error;

/// Read-only view of the VirtualMachineDefinition informer cache.
#[cfg_attr(test, automock)]
pub trait DefinitionCache: Send + Sync {
    /// Look up a definition by its `namespace/name` cache key.
    fn get(&self, key: &str) -> Option<Arc<VirtualMachineDefinition>>;

    /// All definitions in the given namespace.
    fn list_namespace(&self, namespace: &str) -> Vec<Arc<VirtualMachineDefinition>>;
}

/// Read-only view of the VirtualMachineInstance informer cache.
///
/// The cache must expose a namespace index; listing is the only read
/// the controller performs against it.
#[cfg_attr(test, automock)]
pub trait InstanceCache: Send + Sync {
    /// All instances in the given namespace.
    fn list_namespace(&self, namespace: &str) -> Result<Vec<Arc<VirtualMachineInstance>>, Error>;
}

/// Typed operations against the orchestration API.
///
/// Every method is fallible; errors propagate to the reconciler where
/// the retryability classification decides requeueing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtClient: Send + Sync {
    /// Fetch a definition directly from the API server, bypassing the
    /// cache. Returns `None` on 404.
    async fn get_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineDefinition>, Error>;

    /// Persist the status subresource of a definition.
    async fn update_definition_status(
        &self,
        definition: &VirtualMachineDefinition,
    ) -> Result<(), Error>;

    /// Create an instance in the given namespace.
    async fn create_instance(
        &self,
        namespace: &str,
        instance: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, Error>;

    /// Delete an instance by name.
    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Apply a JSON merge patch to an instance's metadata.
    async fn patch_instance(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;
}

/// A delete notification from the instance informer.
///
/// When the informer missed the final state of an object (a dropped
/// watch event noticed on relist), the notification carries a tombstone
/// instead of a live object.
pub enum InstanceDeleteEvent {
    /// The deleted instance as last observed.
    Instance(Arc<VirtualMachineInstance>),
    /// Placeholder for an instance whose deletion was missed; the
    /// embedded state, if any, may be stale.
    Tombstone {
        /// Cache key of the vanished instance.
        key: String,
        /// Last known state, when the cache still had one.
        instance: Option<Arc<VirtualMachineInstance>>,
    },
}

/// Definition cache backed by a reflector store.
pub struct ReflectorDefinitionCache {
    store: Store<VirtualMachineDefinition>,
}

impl ReflectorDefinitionCache {
    /// Wrap a reflector store.
    pub fn new(store: Store<VirtualMachineDefinition>) -> Self {
        Self { store }
    }
}

impl DefinitionCache for ReflectorDefinitionCache {
    fn get(&self, key: &str) -> Option<Arc<VirtualMachineDefinition>> {
        let (namespace, name) = key.split_once('/')?;
        self.store
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn list_namespace(&self, namespace: &str) -> Vec<Arc<VirtualMachineDefinition>> {
        self.store
            .state()
            .into_iter()
            .filter(|d| d.namespace().as_deref() == Some(namespace))
            .collect()
    }
}

/// Instance cache backed by a reflector store.
pub struct ReflectorInstanceCache {
    store: Store<VirtualMachineInstance>,
}

impl ReflectorInstanceCache {
    /// Wrap a reflector store.
    pub fn new(store: Store<VirtualMachineInstance>) -> Self {
        Self { store }
    }
}

impl InstanceCache for ReflectorInstanceCache {
    fn list_namespace(&self, namespace: &str) -> Result<Vec<Arc<VirtualMachineInstance>>, Error> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|i| i.namespace().as_deref() == Some(namespace))
            .collect())
    }
}

/// Production `VirtClient` over `kube::Api`.
pub struct VirtClientImpl {
    client: Client,
}

impl VirtClientImpl {
    /// Create a client for the given cluster connection.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn definitions(&self, namespace: &str) -> Api<VirtualMachineDefinition> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn instances(&self, namespace: &str) -> Api<VirtualMachineInstance> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl VirtClient for VirtClientImpl {
    async fn get_definition(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineDefinition>, Error> {
        match self.definitions(namespace).get(name).await {
            Ok(definition) => Ok(Some(definition)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_definition_status(
        &self,
        definition: &VirtualMachineDefinition,
    ) -> Result<(), Error> {
        let name = definition.name_any();
        let namespace = definition.namespace().unwrap_or_default();
        self.definitions(&namespace)
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": definition.status })),
            )
            .await?;
        Ok(())
    }

    async fn create_instance(
        &self,
        namespace: &str,
        instance: &VirtualMachineInstance,
    ) -> Result<VirtualMachineInstance, Error> {
        Ok(self
            .instances(namespace)
            .create(&PostParams::default(), instance)
            .await?)
    }

    async fn delete_instance(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.instances(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_instance(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        self.instances(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
