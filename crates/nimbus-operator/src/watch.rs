//! Watch-stream adapter feeding the controller's event handlers
//!
//! Bridges `kube::runtime::watcher` streams into the controller's
//! add/update/delete handlers. Streams run through reflector writers
//! first, so the cache reflects an event before its handler runs. On
//! every relist the adapter diffs the cache against the fresh state and
//! synthesizes tombstone deletes for objects whose removal was missed
//! while the watch was down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::store::Writer;
use kube::runtime::{reflector, watcher};
use kube::Api;
use tracing::warn;

use nimbus_common::crd::{VirtualMachineDefinition, VirtualMachineInstance};
use nimbus_common::object_key;

use crate::controller::DefinitionController;
use crate::stores::InstanceDeleteEvent;

/// Drive the definition watch until the stream ends.
pub async fn run_definition_watch(
    api: Api<VirtualMachineDefinition>,
    writer: Writer<VirtualMachineDefinition>,
    controller: Arc<DefinitionController>,
) {
    let mut known: HashMap<String, Arc<VirtualMachineDefinition>> = HashMap::new();
    let mut relist: Option<HashSet<String>> = None;

    let mut stream = reflector(writer, watcher(api, watcher::Config::default())).boxed();
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "definition watch error");
                continue;
            }
        };
        match event {
            watcher::Event::Init => {
                relist = Some(HashSet::new());
            }
            watcher::Event::InitDone => {
                if let Some(seen) = relist.take() {
                    let missed: Vec<String> = known
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    for key in missed {
                        if let Some(definition) = known.remove(&key) {
                            controller.on_definition_delete(&definition);
                        }
                    }
                }
            }
            watcher::Event::Apply(definition) | watcher::Event::InitApply(definition) => {
                let definition = Arc::new(definition);
                let Some(key) = object_key(&definition.metadata) else {
                    continue;
                };
                if let Some(seen) = relist.as_mut() {
                    seen.insert(key.clone());
                }
                match known.insert(key, Arc::clone(&definition)) {
                    Some(old) => controller.on_definition_update(&old, &definition),
                    None => controller.on_definition_add(&definition),
                }
            }
            watcher::Event::Delete(definition) => {
                if let Some(key) = object_key(&definition.metadata) {
                    known.remove(&key);
                }
                controller.on_definition_delete(&definition);
            }
        }
    }
}

/// Drive the instance watch until the stream ends.
pub async fn run_instance_watch(
    api: Api<VirtualMachineInstance>,
    writer: Writer<VirtualMachineInstance>,
    controller: Arc<DefinitionController>,
) {
    let mut known: HashMap<String, Arc<VirtualMachineInstance>> = HashMap::new();
    let mut relist: Option<HashSet<String>> = None;

    let mut stream = reflector(writer, watcher(api, watcher::Config::default())).boxed();
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "instance watch error");
                continue;
            }
        };
        match event {
            watcher::Event::Init => {
                relist = Some(HashSet::new());
            }
            watcher::Event::InitDone => {
                if let Some(seen) = relist.take() {
                    let missed: Vec<String> = known
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    for key in missed {
                        let instance = known.remove(&key);
                        controller.on_instance_delete(&InstanceDeleteEvent::Tombstone {
                            key,
                            instance,
                        });
                    }
                }
            }
            watcher::Event::Apply(instance) | watcher::Event::InitApply(instance) => {
                let instance = Arc::new(instance);
                let Some(key) = object_key(&instance.metadata) else {
                    continue;
                };
                if let Some(seen) = relist.as_mut() {
                    seen.insert(key.clone());
                }
                match known.insert(key, Arc::clone(&instance)) {
                    Some(old) => controller.on_instance_update(&old, &instance),
                    None => controller.on_instance_add(&instance),
                }
            }
            watcher::Event::Delete(instance) => {
                let instance = Arc::new(instance);
                if let Some(key) = object_key(&instance.metadata) {
                    known.remove(&key);
                }
                controller.on_instance_delete(&InstanceDeleteEvent::Instance(instance));
            }
        }
    }
}
