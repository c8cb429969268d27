//! Ownership: controller-ref resolution and instance claiming
//!
//! A definition claims instances through the controller owner reference
//! on the instance. The claim manager classifies the candidates of a
//! namespace into owned, other-owned, and orphaned instances, releases
//! owned instances whose labels drifted off the selector, and adopts
//! matching orphans — but only after re-reading the definition straight
//! from the API server. The cache may still show a definition that has
//! been deleted; adopting an orphan under a dead parent would leak it
//! once the orphan finalizer runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::json;
use thiserror::Error as ThisError;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use nimbus_common::crd::{LabelSelector, VirtualMachineDefinition, VirtualMachineInstance};
use nimbus_common::{controller_of, Error};

use crate::stores::{DefinitionCache, VirtClient};

/// Failure modes of a claim pass.
#[derive(Debug, ThisError)]
pub enum ClaimError {
    /// The uncached recheck found the definition gone, replaced, or
    /// being deleted. Not an error to surface: the reconciler waits for
    /// the cache to catch up.
    #[error("definition {0} is stale or being deleted")]
    Stale(String),

    /// An API operation failed; transient, propagated to the queue.
    #[error(transparent)]
    Api(#[from] Error),
}

/// Resolve a recorded controller reference to the live definition.
///
/// Rejects references of foreign kinds, then looks the definition up in
/// the cache by `namespace/name`. A UID mismatch means the name has
/// been reused by a different object and resolves to nothing.
pub fn resolve_controller_ref(
    cache: &dyn DefinitionCache,
    namespace: &str,
    controller_ref: &OwnerReference,
) -> Option<Arc<VirtualMachineDefinition>> {
    if controller_ref.kind != VirtualMachineDefinition::kind(&()) {
        return None;
    }
    let definition = cache.get(&format!("{namespace}/{}", controller_ref.name))?;
    if definition.metadata.uid.as_deref() != Some(controller_ref.uid.as_str()) {
        return None;
    }
    Some(definition)
}

/// Claims instances for one definition during a single reconcile pass.
pub struct InstanceClaimManager<'a> {
    definition: &'a VirtualMachineDefinition,
    selector: &'a LabelSelector,
    client: &'a dyn VirtClient,
    // the uncached recheck runs at most once per pass
    can_adopt: OnceCell<bool>,
}

impl<'a> InstanceClaimManager<'a> {
    /// Create a claim manager for the definition and its parsed selector.
    pub fn new(
        definition: &'a VirtualMachineDefinition,
        selector: &'a LabelSelector,
        client: &'a dyn VirtClient,
    ) -> Self {
        Self {
            definition,
            selector,
            client,
            can_adopt: OnceCell::new(),
        }
    }

    /// Classify and claim the given candidates.
    ///
    /// Returns the instances owned by the definition after releases and
    /// adoptions have been applied.
    pub async fn claim_instances(
        &self,
        instances: &[Arc<VirtualMachineInstance>],
    ) -> Result<Vec<Arc<VirtualMachineInstance>>, ClaimError> {
        let my_uid = self.definition.metadata.uid.as_deref().unwrap_or_default();
        let empty = BTreeMap::new();
        let mut owned = Vec::new();

        for instance in instances {
            let labels = instance.metadata.labels.as_ref().unwrap_or(&empty);
            match controller_of(&instance.metadata) {
                Some(controller_ref) if controller_ref.uid == my_uid => {
                    if self.selector.matches(labels) {
                        owned.push(Arc::clone(instance));
                    } else {
                        debug!(
                            instance = %instance.name_any(),
                            "labels drifted off the selector, releasing"
                        );
                        self.release(instance).await?;
                    }
                }
                Some(_) => {
                    // controlled by someone else
                }
                None => {
                    if self.definition.metadata.deletion_timestamp.is_some()
                        || instance.metadata.deletion_timestamp.is_some()
                        || !self.selector.matches(labels)
                    {
                        continue;
                    }
                    if self.adopt(instance).await? {
                        owned.push(Arc::clone(instance));
                    }
                }
            }
        }

        Ok(owned)
    }

    /// Adopt an orphan by setting the controller owner reference.
    ///
    /// Returns false when the adoption was skipped because the uncached
    /// recheck could not confirm the definition.
    async fn adopt(&self, instance: &VirtualMachineInstance) -> Result<bool, ClaimError> {
        if !self.confirm_definition().await? {
            return Err(ClaimError::Stale(self.definition.name_any()));
        }

        let patch = json!({
            "metadata": {
                "ownerReferences": [self.definition.controller_owner_reference()],
            }
        });
        let namespace = instance.namespace().unwrap_or_default();
        match self
            .client
            .patch_instance(&namespace, &instance.name_any(), &patch)
            .await
        {
            Ok(()) => {
                debug!(instance = %instance.name_any(), "adopted orphan instance");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release an owned instance by dropping the definition's owner
    /// reference.
    pub async fn release(&self, instance: &VirtualMachineInstance) -> Result<(), Error> {
        let my_uid = self.definition.metadata.uid.as_deref().unwrap_or_default();
        let remaining: Vec<&OwnerReference> = instance
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|r| r.uid != my_uid)
            .collect();

        let patch = json!({
            "metadata": {
                "ownerReferences": remaining,
            }
        });
        let namespace = instance.namespace().unwrap_or_default();
        match self
            .client
            .patch_instance(&namespace, &instance.name_any(), &patch)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                // already gone; nothing left to release
                Ok(())
            }
            Err(e) => {
                warn!(
                    instance = %instance.name_any(),
                    error = %e,
                    "failed to release instance"
                );
                Err(e)
            }
        }
    }

    /// Confirm through an uncached read that the definition still
    /// exists with the same UID and is not being deleted.
    async fn confirm_definition(&self) -> Result<bool, Error> {
        let confirmed = self
            .can_adopt
            .get_or_try_init(|| async {
                let namespace = self.definition.namespace().unwrap_or_default();
                let name = self.definition.name_any();
                let fresh = self.client.get_definition(&namespace, &name).await?;
                Ok::<bool, Error>(match fresh {
                    None => false,
                    Some(fresh) => {
                        fresh.metadata.uid == self.definition.metadata.uid
                            && fresh.metadata.deletion_timestamp.is_none()
                    }
                })
            })
            .await?;
        Ok(*confirmed)
    }
}
