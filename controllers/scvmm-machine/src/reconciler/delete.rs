//! Deletion workflow
//!
//! The finalizer is released only once the VM is gone: either no VM name was
//! ever assigned, or `RemoveVM` reported "Removed" and the AD computer (if
//! any) was removed too.

use super::machine::ad_computer_request;
use super::{object_key, Reconciler, Requeue};
use crate::conditions::{mark_false, VM_DELETING, VM_FAILED};
use crate::error::ControllerError;
use crate::provider::ProviderConfig;
use crds::{ConditionSeverity, ScvmmMachine, VM_CREATED_CONDITION};
use scvmm_client::ScvmmClientTrait;
use tracing::{debug, info};

/// Message of a completed `RemoveVM`
pub const REMOVED: &str = "Removed";

impl Reconciler {
    pub async fn reconcile_delete(&self, machine: &mut ScvmmMachine) -> Result<Requeue, ControllerError> {
        let key = object_key(machine);

        if !machine.has_finalizer() {
            debug!("ScvmmMachine {} has no finalizer, nothing to clean up", key);
            return Ok(Requeue::None);
        }

        if machine.spec.vm_name.is_empty() {
            info!("ScvmmMachine {} never got a VM, removing finalizer", key);
            machine.remove_finalizer();
            self.patch_machine(machine).await?;
            return Ok(Requeue::None);
        }

        let status = machine.status_mut();
        status.ready = false;
        mark_false(
            &mut status.conditions,
            VM_CREATED_CONDITION,
            VM_DELETING,
            ConditionSeverity::Info,
            "",
        );
        self.patch_machine(machine).await?;

        let dependencies = self.lookup_dependencies(machine).await;
        let provider = self.provider_for(machine, &dependencies).await?;
        let client = self.connect(machine, &provider).await?;
        let result = self.remove_vm(client.as_ref(), machine, &provider).await;
        client.close().await;
        result
    }

    async fn remove_vm(
        &self,
        client: &dyn ScvmmClientTrait,
        machine: &mut ScvmmMachine,
        provider: &ProviderConfig,
    ) -> Result<Requeue, ControllerError> {
        let key = object_key(machine);

        info!("Removing VM {} for ScvmmMachine {}", machine.spec.vm_name, key);
        let removed = match client.remove_vm(&machine.spec.vm_name).await {
            Ok(removed) => removed,
            Err(e) => {
                return Err(self
                    .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed to delete VM", e)
                    .await);
            }
        };
        if let Some(failure) = removed.failure() {
            let failure = failure.to_string();
            return self
                .remote_failure(machine, VM_CREATED_CONDITION, "Failed to delete VM", &failure)
                .await;
        }

        if removed.message != REMOVED {
            debug!("VM {} of ScvmmMachine {} is {}", machine.spec.vm_name, key, removed.status);
            let status = machine.status_mut();
            if !removed.status.is_empty() {
                status.vm_status = removed.status.clone();
            }
            if removed.creation_time.is_some() {
                status.creation_time = removed.creation_time;
            }
            if removed.modified_time.is_some() {
                status.modified_time = removed.modified_time;
            }
            return self
                .patch_reason_condition(
                    machine,
                    VM_CREATED_CONDITION,
                    VM_DELETING,
                    ConditionSeverity::Info,
                    "",
                    Requeue::POLL,
                )
                .await;
        }

        if let Some(request) = ad_computer_request(&machine.spec, provider) {
            info!("Removing AD computer {} for ScvmmMachine {}", request.name, key);
            let removed = match client.remove_ad_computer(&request).await {
                Ok(removed) => removed,
                Err(e) => {
                    return Err(self
                        .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed to remove AD entry", e)
                        .await);
                }
            };
            if let Some(failure) = removed.failure() {
                let failure = failure.to_string();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to remove AD entry", &failure)
                    .await;
            }
        }

        info!("VM {} removed, releasing ScvmmMachine {}", machine.spec.vm_name, key);
        machine.remove_finalizer();
        self.patch_machine(machine).await?;
        Ok(Requeue::None)
    }
}
