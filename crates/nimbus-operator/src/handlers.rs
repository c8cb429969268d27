//! Informer-facing event handlers
//!
//! Translates cache add/update/delete notifications on definitions and
//! instances into queue enqueues and expectation observations. Handlers
//! run on the informer delivery thread and must stay cheap: resolve,
//! record, enqueue.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, error};

use nimbus_common::crd::{VirtualMachineDefinition, VirtualMachineInstance};
use nimbus_common::{controller_of, object_key};

use crate::adoption::resolve_controller_ref;
use crate::controller::DefinitionController;
use crate::stores::InstanceDeleteEvent;

impl DefinitionController {
    /// A definition appeared.
    pub fn on_definition_add(&self, definition: &VirtualMachineDefinition) {
        self.enqueue_definition(definition);
    }

    /// A definition changed.
    pub fn on_definition_update(
        &self,
        _old: &VirtualMachineDefinition,
        current: &VirtualMachineDefinition,
    ) {
        self.enqueue_definition(current);
    }

    /// A definition went away.
    pub fn on_definition_delete(&self, definition: &VirtualMachineDefinition) {
        self.enqueue_definition(definition);
    }

    /// An instance appeared in the cache.
    ///
    /// If it is owned, this observation may cancel a pending creation
    /// expectation. An orphan wakes every definition whose selector
    /// matches, so one of them can adopt it.
    pub fn on_instance_add(&self, instance: &Arc<VirtualMachineInstance>) {
        if instance.metadata.deletion_timestamp.is_some() {
            // a restart can surface instances already pending deletion;
            // they must not count as creation observations
            self.on_instance_delete(&InstanceDeleteEvent::Instance(Arc::clone(instance)));
            return;
        }

        let namespace = instance.namespace().unwrap_or_default();
        if let Some(controller_ref) = controller_of(&instance.metadata) {
            let Some(definition) =
                resolve_controller_ref(self.definitions.as_ref(), &namespace, controller_ref)
            else {
                return;
            };
            let Some(key) = object_key(&definition.metadata) else {
                return;
            };
            debug!(instance = %instance.name_any(), "instance created");
            self.expectations.creation_observed(&key);
            self.queue.add(&key);
            return;
        }

        // orphan: nobody is waiting on it, so no creation observation
        for definition in self.matching_definitions(instance) {
            debug!(instance = %instance.name_any(), "orphan instance created");
            self.enqueue_definition(&definition);
        }
    }

    /// An instance changed in the cache.
    pub fn on_instance_update(
        &self,
        old: &Arc<VirtualMachineInstance>,
        current: &Arc<VirtualMachineInstance>,
    ) {
        if current.resource_version() == old.resource_version() {
            // periodic resyncs replay every known instance; two versions
            // of the same instance always differ in resource version
            return;
        }

        let labels_changed = current.metadata.labels != old.metadata.labels;
        if current.metadata.deletion_timestamp.is_some() {
            // a graceful deletion first surfaces as an update carrying
            // the deletion timestamp; react immediately instead of
            // waiting for the final removal
            self.on_instance_delete(&InstanceDeleteEvent::Instance(Arc::clone(current)));
            if labels_changed {
                self.on_instance_delete(&InstanceDeleteEvent::Instance(Arc::clone(old)));
            }
            return;
        }

        let namespace = current.namespace().unwrap_or_default();
        let current_ref = controller_of(&current.metadata);
        let old_ref = controller_of(&old.metadata);
        let ref_changed = current_ref != old_ref;
        if ref_changed {
            if let Some(old_ref) = old_ref {
                // the old controller lost this instance; let it notice
                if let Some(definition) =
                    resolve_controller_ref(self.definitions.as_ref(), &namespace, old_ref)
                {
                    self.enqueue_definition(&definition);
                }
            }
        }

        if let Some(controller_ref) = current_ref {
            if let Some(definition) =
                resolve_controller_ref(self.definitions.as_ref(), &namespace, controller_ref)
            {
                debug!(instance = %current.name_any(), "instance updated");
                self.enqueue_definition(&definition);
            }
            return;
        }

        if labels_changed || ref_changed {
            for definition in self.matching_definitions(current) {
                debug!(instance = %current.name_any(), "orphan instance updated");
                self.enqueue_definition(&definition);
            }
        }
    }

    /// An instance disappeared from the cache, possibly via tombstone.
    pub fn on_instance_delete(&self, event: &InstanceDeleteEvent) {
        let instance = match event {
            InstanceDeleteEvent::Instance(instance) => instance,
            InstanceDeleteEvent::Tombstone {
                key,
                instance: Some(instance),
            } => {
                debug!(key = %key, "recovered instance from tombstone");
                instance
            }
            InstanceDeleteEvent::Tombstone { key, instance: None } => {
                error!(key = %key, "tombstone carried no instance state");
                return;
            }
        };

        let Some(controller_ref) = controller_of(&instance.metadata) else {
            // no controller is waiting on orphans going away
            return;
        };
        let namespace = instance.namespace().unwrap_or_default();
        let Some(definition) =
            resolve_controller_ref(self.definitions.as_ref(), &namespace, controller_ref)
        else {
            return;
        };
        let Some(key) = object_key(&definition.metadata) else {
            return;
        };
        let Some(instance_key) = object_key(&instance.metadata) else {
            return;
        };

        self.expectations.deletion_observed(&key, &instance_key);
        self.queue.add(&key);
    }

    /// Definitions in the instance's namespace whose selector claims
    /// its labels.
    fn matching_definitions(
        &self,
        instance: &VirtualMachineInstance,
    ) -> Vec<Arc<VirtualMachineDefinition>> {
        let namespace = instance.namespace().unwrap_or_default();
        let empty = BTreeMap::new();
        let labels = instance.metadata.labels.as_ref().unwrap_or(&empty);
        self.definitions
            .list_namespace(&namespace)
            .into_iter()
            .filter(|definition| {
                definition.spec.selector.as_ref().is_some_and(|selector| {
                    selector.validate().is_ok() && selector.matches(labels)
                })
            })
            .collect()
    }

    fn enqueue_definition(&self, definition: &VirtualMachineDefinition) {
        let Some(key) = object_key(&definition.metadata) else {
            error!("definition without a name cannot be enqueued");
            return;
        };
        self.queue.add(&key);
    }
}
