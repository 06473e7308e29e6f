//! Creation, power-on and readiness of a machine's VM

use super::{object_key, Dependencies, Reconciler, Requeue};
use crate::bootstrap::{complete_media, inline_media, secret_user_data};
use crate::conditions::{
    mark_false, mark_true, VM_CREATING, VM_FAILED, VM_STARTING, VM_UPDATING,
    WAITING_FOR_BOOTSTRAP_DATA, WAITING_FOR_CONTROLPLANE_AVAILABLE,
};
use crate::error::ControllerError;
use crate::provider::ProviderConfig;
use crds::{
    ConditionSeverity, MachineAddress, MachineAddressType, QuantityError, ScvmmMachine, ScvmmMachineSpec,
    VmDisk, MEBIBYTE, PROVIDER_ID_PREFIX, VM_CREATED_CONDITION, VM_RUNNING_CONDITION,
};
use scvmm_client::{
    AdComputerRequest, CloudInitMedia, CreateVmRequest, DiskParameter, ScvmmClientTrait, SpecPayload,
    VirtualDiskInfo, VmResult,
};
use tracing::{debug, info, warn};

/// Power state of a VM that has been created but not started
pub const POWER_OFF: &str = "PowerOff";
/// Power state of a started VM
pub const RUNNING: &str = "Running";

/// Disks as passed to `CreateVM` and `ExpandVMDisks`
pub fn disk_parameters(disks: &[VmDisk]) -> Result<Vec<DiskParameter>, QuantityError> {
    disks
        .iter()
        .map(|disk| {
            Ok(DiskParameter {
                size_mb: disk.size_bytes()? / MEBIBYTE,
                vh_disk: disk.vh_disk.clone(),
                dynamic: disk.dynamic,
            })
        })
        .collect()
}

/// Whether any declared disk is more than a mebibyte larger than its remote maximum
///
/// Disks without a declared size or without a remote counterpart are skipped.
pub fn needs_expansion(disks: &[VmDisk], remote: &[VirtualDiskInfo]) -> Result<bool, QuantityError> {
    for (disk, remote) in disks.iter().zip(remote) {
        let target = disk.size_bytes()?;
        if target > 0 && target > remote.maximum_size + MEBIBYTE {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Check every size in the spec parses; absent sizes are fine
pub fn validate_sizes(spec: &ScvmmMachineSpec) -> Result<(), QuantityError> {
    spec.memory_bytes()?;
    for disk in &spec.disks {
        disk.size_bytes()?;
    }
    Ok(())
}

/// AD computer object for the machine, with the provider's directory server as fallback
pub fn ad_computer_request(spec: &ScvmmMachineSpec, provider: &ProviderConfig) -> Option<AdComputerRequest> {
    let ad = spec.active_directory.as_ref()?;
    let domain_controller = if ad.domain_controller.is_empty() {
        provider.ad_server.clone()
    } else {
        ad.domain_controller.clone()
    };
    Some(AdComputerRequest {
        name: spec.vm_name.clone(),
        ou_path: ad.ou_path.clone(),
        domain_controller,
        description: ad.description.clone(),
        member_of: ad.member_of.clone(),
    })
}

fn create_vm_request(spec: &ScvmmMachineSpec) -> Result<CreateVmRequest, QuantityError> {
    Ok(CreateVmRequest {
        cloud: spec.cloud.clone(),
        host_group: spec.host_group.clone(),
        vm_name: spec.vm_name.clone(),
        vm_template: spec.vm_template.clone(),
        memory_mb: spec.memory_bytes()? / MEBIBYTE,
        cpu_count: spec.cpu_count,
        disks: disk_parameters(&spec.disks)?,
        vm_network: spec.vm_network.clone(),
        hardware_profile: spec.hardware_profile.clone(),
        description: spec.description.clone(),
        start_action: spec.start_action.clone(),
        stop_action: spec.stop_action.clone(),
    })
}

/// Copy identifiers and power state of a remote answer into the machine
fn record_vm(machine: &mut ScvmmMachine, vm: &VmResult) {
    if !vm.vm_id.is_empty() {
        machine.spec.provider_id = Some(format!("{}{}", PROVIDER_ID_PREFIX, vm.vm_id));
    }
    let status = machine.status_mut();
    if !vm.status.is_empty() {
        status.vm_status = vm.status.clone();
    }
    if !vm.bios_guid.is_empty() {
        status.bios_guid = vm.bios_guid.clone();
    }
    if !vm.vm_id.is_empty() {
        status.vm_id = vm.vm_id.clone();
    }
    if vm.creation_time.is_some() {
        status.creation_time = vm.creation_time;
    }
    if vm.modified_time.is_some() {
        status.modified_time = vm.modified_time;
    }
}

fn spec_payload(machine: &ScvmmMachine) -> Result<SpecPayload, ControllerError> {
    Ok(SpecPayload::new(&machine.spec, &machine.metadata)?)
}

/// Bootstrap payload, or the reason it is not available yet
enum BootstrapData {
    Waiting(&'static str),
    Ready(CloudInitMedia),
}

impl Reconciler {
    /// Drive an existing or missing VM one step towards running
    pub async fn reconcile_normal(
        &self,
        machine: &mut ScvmmMachine,
        dependencies: &Dependencies,
        provider: &ProviderConfig,
    ) -> Result<Requeue, ControllerError> {
        if let Err(e) = validate_sizes(&machine.spec) {
            let message = format!("Invalid machine size: {}", e);
            warn!("ScvmmMachine {}: {}", object_key(machine), message);
            return self
                .patch_reason_condition(
                    machine,
                    VM_CREATED_CONDITION,
                    VM_FAILED,
                    ConditionSeverity::Error,
                    &message,
                    Requeue::None,
                )
                .await;
        }

        let client = self.connect(machine, provider).await?;
        let result = self.reconcile_vm(client.as_ref(), machine, dependencies, provider).await;
        client.close().await;
        result
    }

    async fn reconcile_vm(
        &self,
        client: &dyn ScvmmClientTrait,
        machine: &mut ScvmmMachine,
        dependencies: &Dependencies,
        provider: &ProviderConfig,
    ) -> Result<Requeue, ControllerError> {
        let key = object_key(machine);

        let mut vm = VmResult::default();
        if !machine.spec.vm_name.is_empty() {
            debug!("Looking up VM {} for ScvmmMachine {}", machine.spec.vm_name, key);
            vm = client.get_vm(&machine.spec.vm_name).await?;
            if let Some(failure) = vm.failure() {
                let failure = failure.to_string();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to get vm", &failure)
                    .await;
            }
        }

        if !vm.exists() {
            return self.create_vm(client, machine, provider).await;
        }

        mark_true(&mut machine.status_mut().conditions, VM_CREATED_CONDITION);
        record_vm(machine, &vm);
        machine.status_mut().ready = vm.status == RUNNING;

        if vm.status == POWER_OFF {
            return self.start_vm(client, machine, dependencies, provider, &vm).await;
        }

        if vm.status != RUNNING {
            debug!("VM {} of ScvmmMachine {} is {}", vm.name, key, vm.status);
            return self
                .patch_reason_condition(
                    machine,
                    VM_RUNNING_CONDITION,
                    VM_STARTING,
                    ConditionSeverity::Info,
                    "",
                    Requeue::POLL,
                )
                .await;
        }

        let status = machine.status_mut();
        if !vm.ipv4_addresses.is_empty() {
            status.addresses = vm
                .ipv4_addresses
                .iter()
                .map(|address| MachineAddress {
                    type_: MachineAddressType::InternalIP,
                    address: address.clone(),
                })
                .collect();
        }
        if !vm.hostname.is_empty() {
            status.hostname = vm.hostname.clone();
        }
        mark_true(&mut status.conditions, VM_RUNNING_CONDITION);
        let complete = !vm.ipv4_addresses.is_empty() && !vm.hostname.is_empty();
        self.patch_machine(machine).await?;

        if complete {
            debug!("ScvmmMachine {} is running", key);
            return Ok(Requeue::None);
        }

        // Guest information shows up some time after power-on
        info!("Refreshing guest information of VM {} for ScvmmMachine {}", vm.name, key);
        let refreshed = client.read_vm(&vm.name).await?;
        if let Some(failure) = refreshed.failure() {
            let failure = failure.to_string();
            return self
                .remote_failure(machine, VM_RUNNING_CONDITION, "Failed to read vm", &failure)
                .await;
        }
        Ok(Requeue::LONG)
    }

    async fn create_vm(
        &self,
        client: &dyn ScvmmClientTrait,
        machine: &mut ScvmmMachine,
        provider: &ProviderConfig,
    ) -> Result<Requeue, ControllerError> {
        let key = object_key(machine);

        if machine.spec.vm_name.is_empty() {
            let payload = spec_payload(machine)?;
            let generated = match client.generate_vm_name(&payload).await {
                Ok(generated) => generated,
                Err(e) => {
                    return Err(self
                        .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed to generate vm name", e)
                        .await);
                }
            };
            if let Some(failure) = generated.failure() {
                let failure = failure.to_string();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to generate vm name", &failure)
                    .await;
            }
            let echoed: ScvmmMachineSpec = generated.decode_spec()?;
            if echoed.vm_name.is_empty() {
                let message = generated.message.clone();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to generate vm name", &message)
                    .await;
            }
            info!("Generated VM name {} for ScvmmMachine {}", echoed.vm_name, key);
            // Persisted with the next patch, so a retry finds what this attempt creates
            machine.spec.vm_name = echoed.vm_name;
        }

        if let Some(request) = ad_computer_request(&machine.spec, provider) {
            info!("Creating AD computer {} for ScvmmMachine {}", request.name, key);
            let created = match client.create_ad_computer(&request).await {
                Ok(created) => created,
                Err(e) => {
                    return Err(self
                        .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed to create AD entry", e)
                        .await);
                }
            };
            if let Some(failure) = created.failure() {
                let failure = failure.to_string();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to create AD entry", &failure)
                    .await;
            }
        }

        info!("Creating VM {} for ScvmmMachine {}", machine.spec.vm_name, key);
        let vm = match client.create_vm(&create_vm_request(&machine.spec)?).await {
            Ok(vm) => vm,
            Err(e) => {
                return Err(self
                    .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed to create vm", e)
                    .await);
            }
        };
        if let Some(failure) = vm.failure() {
            let failure = failure.to_string();
            return self
                .remote_failure(machine, VM_CREATED_CONDITION, "Failed to create vm", &failure)
                .await;
        }

        record_vm(machine, &vm);
        machine.status_mut().ready = false;
        self.patch_reason_condition(
            machine,
            VM_CREATED_CONDITION,
            VM_CREATING,
            ConditionSeverity::Info,
            "",
            Requeue::SHORT,
        )
        .await
    }

    /// A powered-off VM: merge remote spec, grow disks, then boot it
    async fn start_vm(
        &self,
        client: &dyn ScvmmClientTrait,
        machine: &mut ScvmmMachine,
        dependencies: &Dependencies,
        provider: &ProviderConfig,
        vm: &VmResult,
    ) -> Result<Requeue, ControllerError> {
        let key = object_key(machine);

        let payload = spec_payload(machine)?;
        let amended = match client.add_vm_spec(&payload).await {
            Ok(amended) => amended,
            Err(e) => {
                return Err(self
                    .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed calling add spec function", e)
                    .await);
            }
        };
        if let Some(failure) = amended.failure() {
            let failure = failure.to_string();
            return self
                .remote_failure(machine, VM_CREATED_CONDITION, "Failed calling add spec function", &failure)
                .await;
        }
        let echoed: ScvmmMachineSpec = amended.decode_spec()?;
        if machine.spec.merge_non_zero(&echoed) {
            debug!("Remote side amended the spec of ScvmmMachine {}", key);
            self.patch_machine(machine).await?;
        }

        if needs_expansion(&machine.spec.disks, &vm.virtual_disks)? {
            info!("Expanding disks of VM {} for ScvmmMachine {}", vm.name, key);
            let disks = disk_parameters(&machine.spec.disks)?;
            let expanded = match client.expand_vm_disks(&vm.name, &disks).await
            {
                Ok(expanded) => expanded,
                Err(e) => {
                    return Err(self
                        .record_error(machine, VM_CREATED_CONDITION, VM_FAILED, "Failed to expand vm disks", e)
                        .await);
                }
            };
            if let Some(failure) = expanded.failure() {
                let failure = failure.to_string();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to expand vm disks", &failure)
                    .await;
            }
            record_vm(machine, &expanded);
            return self
                .patch_reason_condition(
                    machine,
                    VM_CREATED_CONDITION,
                    VM_UPDATING,
                    ConditionSeverity::Info,
                    "",
                    Requeue::SHORT,
                )
                .await;
        }

        let media = match self.bootstrap_data(machine, dependencies).await {
            Ok(BootstrapData::Ready(media)) => media,
            Ok(BootstrapData::Waiting(reason)) => {
                info!("ScvmmMachine {} is waiting: {}", key, reason);
                return self
                    .patch_reason_condition(
                        machine,
                        VM_CREATED_CONDITION,
                        reason,
                        ConditionSeverity::Info,
                        "",
                        Requeue::None,
                    )
                    .await;
            }
            Err(e) => {
                return Err(self
                    .record_error(
                        machine,
                        VM_CREATED_CONDITION,
                        WAITING_FOR_BOOTSTRAP_DATA,
                        "Failed to get bootstrap data",
                        e,
                    )
                    .await);
            }
        };

        let started = if media.is_empty() {
            info!("Starting VM {} for ScvmmMachine {}", vm.name, key);
            match client.start_vm(&vm.name).await {
                Ok(started) => started,
                Err(e) => {
                    return Err(self
                        .record_error(machine, VM_RUNNING_CONDITION, VM_FAILED, "Failed to start vm", e)
                        .await);
                }
            }
        } else {
            let media = complete_media(media, &machine.spec, &vm.vm_id)?;
            let iso_path = provider.iso_path(&vm.name);
            info!("Writing cloud-init media {} for ScvmmMachine {}", iso_path, key);
            let written = match client.write_cloud_init_iso(&iso_path, &media).await {
                Ok(written) => written,
                Err(e) => {
                    return Err(self
                        .record_error(
                            machine,
                            VM_CREATED_CONDITION,
                            WAITING_FOR_BOOTSTRAP_DATA,
                            "Failed to create cloud init data",
                            e,
                        )
                        .await);
                }
            };
            if let Some(failure) = written.failure() {
                let failure = failure.to_string();
                return self
                    .remote_failure(machine, VM_CREATED_CONDITION, "Failed to create cloud init data", &failure)
                    .await;
            }

            mark_false(
                &mut machine.status_mut().conditions,
                VM_RUNNING_CONDITION,
                VM_STARTING,
                ConditionSeverity::Info,
                "",
            );
            self.patch_machine(machine).await?;

            info!("Attaching {} and starting VM {} for ScvmmMachine {}", iso_path, vm.name, key);
            match client.add_iso_to_vm(&vm.name, &iso_path).await {
                Ok(started) => started,
                Err(e) => {
                    return Err(self
                        .record_error(machine, VM_RUNNING_CONDITION, VM_FAILED, "Failed to add iso to vm", e)
                        .await);
                }
            }
        };
        if let Some(failure) = started.failure() {
            let failure = failure.to_string();
            return self
                .remote_failure(machine, VM_RUNNING_CONDITION, "Failed to start vm", &failure)
                .await;
        }

        record_vm(machine, &started);
        self.patch_machine(machine).await?;
        Ok(Requeue::SHORT)
    }

    /// User-data from the owner's bootstrap secret, or the inline cloud-init
    async fn bootstrap_data(
        &self,
        machine: &ScvmmMachine,
        dependencies: &Dependencies,
    ) -> Result<BootstrapData, ControllerError> {
        let Some(owner) = &dependencies.owner else {
            return Ok(BootstrapData::Ready(
                machine.spec.cloud_init.as_ref().map(inline_media).unwrap_or_default(),
            ));
        };

        let Some(secret_name) = owner.spec.bootstrap.data_secret_name.as_deref() else {
            let control_plane_ready = dependencies
                .cluster
                .as_ref()
                .is_some_and(|cluster| cluster.control_plane_initialized());
            if !owner.is_control_plane() && !control_plane_ready {
                return Ok(BootstrapData::Waiting(WAITING_FOR_CONTROLPLANE_AVAILABLE));
            }
            return Ok(BootstrapData::Waiting(WAITING_FOR_BOOTSTRAP_DATA));
        };

        let namespace = owner.metadata.namespace.as_deref().unwrap_or("default");
        let secret = self
            .store
            .secret(namespace, secret_name)
            .await?
            .ok_or_else(|| ControllerError::Bootstrap(format!("secret {}/{} not found", namespace, secret_name)))?;
        Ok(BootstrapData::Ready(CloudInitMedia {
            user_data: secret_user_data(&secret)?,
            ..Default::default()
        }))
    }
}
