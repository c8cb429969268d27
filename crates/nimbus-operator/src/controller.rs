//! The VirtualMachineDefinition controller
//!
//! Workers drain the queue and reconcile one definition per key: fetch
//! from cache, validate, claim live instances, decide start/stop, and
//! synthesize status conditions. The expectations store gates the
//! start/stop decision until all previously issued operations have been
//! observed by the cache.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use nimbus_common::crd::{
    ConditionStatus, DefinitionCondition, DefinitionConditionType, InstanceTemplateSpec,
    VirtualMachineDefinition, VirtualMachineInstance,
};
use nimbus_common::events::{actions, reasons, EventPublisher};
use nimbus_common::{has_orphan_finalizer, object_key, Error};

use crate::adoption::{ClaimError, InstanceClaimManager};
use crate::expectations::ExpectationsStore;
use crate::queue::WorkQueue;
use crate::stores::{DefinitionCache, InstanceCache, VirtClient};

/// Reconciles VirtualMachineDefinitions against their instances.
pub struct DefinitionController {
    pub(crate) definitions: Arc<dyn DefinitionCache>,
    pub(crate) instances: Arc<dyn InstanceCache>,
    pub(crate) client: Arc<dyn VirtClient>,
    pub(crate) events: Arc<dyn EventPublisher>,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) expectations: ExpectationsStore,
}

impl DefinitionController {
    /// Wire a controller to its caches, client, and event sink.
    pub fn new(
        definitions: Arc<dyn DefinitionCache>,
        instances: Arc<dyn InstanceCache>,
        client: Arc<dyn VirtClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            definitions,
            instances,
            client,
            events,
            queue: Arc::new(WorkQueue::new()),
            expectations: ExpectationsStore::new(),
        }
    }

    /// Run `workers` parallel reconcile loops until the queue shuts
    /// down.
    pub async fn run(self: Arc<Self>, workers: usize) {
        info!(workers, "starting VirtualMachineDefinition controller");
        let handles: Vec<_> = (0..workers)
            .map(|_| tokio::spawn(Arc::clone(&self).worker()))
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("VirtualMachineDefinition controller stopped");
    }

    /// Request a queue shutdown; running reconciles finish, then the
    /// workers exit.
    pub fn shutdown(&self) {
        self.queue.shut_down();
    }

    async fn worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => {
                    debug!(key = %key, "processed definition");
                    self.queue.forget(&key);
                }
                Err(e) if e.is_retryable() => {
                    info!(key = %key, error = %e, "re-enqueueing definition");
                    self.queue.add_rate_limited(&key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping definition after permanent failure");
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }
    }

    /// Reconcile a single definition by cache key.
    #[instrument(skip(self), fields(definition = %key))]
    pub async fn reconcile(&self, key: &str) -> Result<(), Error> {
        let Some(definition) = self.definitions.get(key) else {
            // it is always possible to re-create this kind of
            // controller state from scratch; just drop the memory
            self.expectations.delete(key);
            return Ok(());
        };

        debug!("reconciling definition");

        // Permanent user errors: log once, await a spec change. The
        // update event will re-enqueue.
        let Some(template) = &definition.spec.template else {
            warn!("definition has no template, will not re-enqueue");
            return Ok(());
        };
        let Some(selector) = &definition.spec.selector else {
            warn!("definition has no selector, will not re-enqueue");
            return Ok(());
        };
        if template.metadata.labels.is_empty() {
            warn!("template has no labels, will not re-enqueue");
            return Ok(());
        }
        if let Err(e) = selector.validate() {
            warn!(error = %e, "invalid selector, will not re-enqueue");
            return Ok(());
        }
        if !selector.matches(&template.metadata.labels) {
            warn!("selector does not match template labels, will not re-enqueue");
            return Ok(());
        }

        let namespace = definition.namespace().unwrap_or_default();
        let candidates = self.instances.list_namespace(&namespace)?;
        let active: Vec<_> = candidates
            .into_iter()
            .filter(|i| !i.is_final())
            .collect();

        let manager = InstanceClaimManager::new(&definition, selector, self.client.as_ref());
        let owned = match manager.claim_instances(&active).await {
            Ok(owned) => owned,
            Err(ClaimError::Stale(name)) => {
                debug!(
                    definition = %name,
                    "definition is stale, waiting for the cache to catch up"
                );
                return Ok(());
            }
            Err(ClaimError::Api(e)) => return Err(e),
        };

        if owned.len() > 1 {
            warn!(
                count = owned.len(),
                "definition owns more than one instance, skipping start/stop"
            );
        }
        let current = if owned.len() == 1 {
            Some(owned[0].as_ref())
        } else {
            None
        };

        let mut start_stop_err = None;
        let needs_sync = self.expectations.satisfied(key);
        if needs_sync && definition.metadata.deletion_timestamp.is_none() && owned.len() <= 1 {
            start_stop_err = self
                .start_stop(key, &definition, template, current)
                .await
                .err();
        }

        // A definition on its way out with the orphan finalizer set:
        // release every instance instead of letting the cascade take
        // them, and leave status alone.
        if definition.metadata.deletion_timestamp.is_some()
            && has_orphan_finalizer(&definition.metadata)
        {
            return self.orphan(&manager, &owned).await;
        }

        if let Some(e) = &start_stop_err {
            error!(error = %e, "starting or stopping the instance failed");
        }

        let status_result = self
            .update_status(&definition, start_stop_err.as_ref())
            .await;
        if let Err(e) = &status_result {
            error!(error = %e, "updating the definition status failed");
        }

        match start_stop_err {
            Some(e) => Err(e),
            None => status_result,
        }
    }

    /// Release every owned instance concurrently; the first error wins.
    async fn orphan(
        &self,
        manager: &InstanceClaimManager<'_>,
        owned: &[Arc<VirtualMachineInstance>],
    ) -> Result<(), Error> {
        let results =
            futures::future::join_all(owned.iter().map(|instance| manager.release(instance)))
                .await;
        match results.into_iter().find_map(|r| r.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Converge the child set towards `spec.running`.
    async fn start_stop(
        &self,
        key: &str,
        definition: &VirtualMachineDefinition,
        template: &InstanceTemplateSpec,
        current: Option<&VirtualMachineInstance>,
    ) -> Result<(), Error> {
        let namespace = definition.namespace().unwrap_or_default();

        if definition.spec.running {
            if current.is_some() {
                // should be running and is running
                return Ok(());
            }

            debug!("starting instance");
            self.expectations.expect_creations(key, 1);
            let instance = build_instance(definition, template);
            match self.client.create_instance(&namespace, &instance).await {
                Ok(created) => {
                    self.events
                        .publish(
                            &definition.object_ref(&()),
                            EventType::Normal,
                            reasons::SUCCESSFUL_CREATE,
                            actions::START,
                            Some(format!(
                                "Created virtual machine instance {}",
                                created.name_any()
                            )),
                        )
                        .await;
                }
                Err(e) => {
                    // a rejected create will never be observed
                    self.expectations.creation_observed(key);
                    self.events
                        .publish(
                            &definition.object_ref(&()),
                            EventType::Warning,
                            reasons::FAILED_CREATE,
                            actions::START,
                            Some(format!("Error creating virtual machine instance: {e}")),
                        )
                        .await;
                    return Err(e);
                }
            }
            return Ok(());
        }

        let Some(instance) = current else {
            // should not run and is not running
            return Ok(());
        };
        let Some(instance_key) = object_key(&instance.metadata) else {
            return Ok(());
        };

        debug!(instance = %instance.name_any(), "stopping instance");
        self.expectations
            .expect_deletions(key, vec![instance_key.clone()]);
        match self
            .client
            .delete_instance(&namespace, &instance.name_any())
            .await
        {
            Ok(()) => {
                self.events
                    .publish(
                        &definition.object_ref(&()),
                        EventType::Normal,
                        reasons::SUCCESSFUL_DELETE,
                        actions::STOP,
                        Some(format!(
                            "Deleted virtual machine instance {}",
                            instance.name_any()
                        )),
                    )
                    .await;
            }
            Err(e) => {
                // a rejected delete will never be observed
                self.expectations.deletion_observed(key, &instance_key);
                self.events
                    .publish(
                        &definition.object_ref(&()),
                        EventType::Warning,
                        reasons::FAILED_DELETE,
                        actions::STOP,
                        Some(format!(
                            "Error deleting virtual machine instance {}: {e}",
                            instance.name_any()
                        )),
                    )
                    .await;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Recompute and persist the `Running`/`Failure` conditions.
    ///
    /// Mutates a copy of the cached definition, never the cached object
    /// itself, and writes only the status.
    async fn update_status(
        &self,
        definition: &VirtualMachineDefinition,
        start_stop_err: Option<&Error>,
    ) -> Result<(), Error> {
        let errors_match = start_stop_err.is_some()
            == definition.has_condition(DefinitionConditionType::Failure);
        let running_matches = definition.spec.running
            == definition.has_condition(DefinitionConditionType::Running);

        if errors_match && running_matches {
            return Ok(());
        }

        let mut updated = definition.clone();
        process_failure(&mut updated, start_stop_err);
        process_running(&mut updated, start_stop_err);

        self.client.update_definition_status(&updated).await?;

        if !running_matches {
            let (reason, note) = if updated.spec.running {
                (reasons::SUCCESSFUL_PAUSED, "Running")
            } else {
                (reasons::SUCCESSFUL_RESUMED, "Stopped")
            };
            self.events
                .publish(
                    &updated.object_ref(&()),
                    EventType::Normal,
                    reason,
                    actions::RECONCILE,
                    Some(note.to_string()),
                )
                .await;
        }

        Ok(())
    }
}

/// Stamp a new instance from the definition's template.
fn build_instance(
    definition: &VirtualMachineDefinition,
    template: &InstanceTemplateSpec,
) -> VirtualMachineInstance {
    let base_name = definition.instance_base_name();
    let annotations = if template.metadata.annotations.is_empty() {
        None
    } else {
        Some(template.metadata.annotations.clone())
    };
    VirtualMachineInstance {
        metadata: ObjectMeta {
            name: Some(base_name.clone()),
            generate_name: Some(base_name),
            namespace: definition.metadata.namespace.clone(),
            labels: Some(template.metadata.labels.clone()),
            annotations,
            owner_references: Some(vec![definition.controller_owner_reference()]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

fn remove_condition(definition: &mut VirtualMachineDefinition, type_: DefinitionConditionType) {
    if let Some(status) = definition.status.as_mut() {
        status.conditions.retain(|c| c.type_ != type_);
    }
}

fn push_condition(definition: &mut VirtualMachineDefinition, condition: DefinitionCondition) {
    definition
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .push(condition);
}

/// Add or drop the `Failure` condition to mirror the last start/stop
/// outcome.
fn process_failure(definition: &mut VirtualMachineDefinition, start_stop_err: Option<&Error>) {
    let has_failure = definition.has_condition(DefinitionConditionType::Failure);
    match start_stop_err {
        Some(e) if !has_failure => {
            let reason = if definition.spec.running {
                reasons::FAILED_CREATE
            } else {
                reasons::FAILED_DELETE
            };
            push_condition(
                definition,
                DefinitionCondition {
                    type_: DefinitionConditionType::Failure,
                    status: ConditionStatus::True,
                    reason: reason.to_string(),
                    message: e.to_string(),
                    last_transition_time: Utc::now(),
                },
            );
        }
        None if has_failure => remove_condition(definition, DefinitionConditionType::Failure),
        _ => {}
    }
}

/// Add the `Running` condition when the definition should and can run;
/// drop it otherwise.
fn process_running(definition: &mut VirtualMachineDefinition, start_stop_err: Option<&Error>) {
    if definition.spec.running
        && start_stop_err.is_none()
        && !definition.has_condition(DefinitionConditionType::Running)
    {
        let note = format!(
            "Created by VirtualMachineDefinition {}",
            definition.name_any()
        );
        push_condition(
            definition,
            DefinitionCondition {
                type_: DefinitionConditionType::Running,
                status: ConditionStatus::True,
                reason: note.clone(),
                message: note,
                last_transition_time: Utc::now(),
            },
        );
        return;
    }

    remove_condition(definition, DefinitionConditionType::Running);
}
