//! ScvmmMachine CRD
//!
//! Desired and observed state of a single virtual machine managed through
//! SCVMM. The spec is written by users (or copied from a
//! ScvmmMachineTemplate); the status is owned by the machine controller.

use crate::conditions::Condition;
use crate::quantity::{optional_quantity, QuantityError};
use crate::references::ProviderReference;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer protecting the SCVMM side VM from being orphaned
pub const MACHINE_FINALIZER: &str = "scvmmmachine.finalizers.cluster.x-k8s.io";

/// Prefix of `spec.providerID`
pub const PROVIDER_ID_PREFIX: &str = "scvmm://";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ScvmmMachine",
    namespaced,
    status = "ScvmmMachineStatus",
    shortname = "scvmmm",
    category = "cluster-api"
)]
#[serde(rename_all = "camelCase", default)]
pub struct ScvmmMachineSpec {
    /// `scvmm://<VMId>`, set by the controller once the VM exists
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Name of the VM; empty means "generate one"
    pub vm_name: String,

    /// SCVMM cloud to place the VM in
    pub cloud: String,

    /// Host group to place the VM in
    pub host_group: String,

    /// VM template to create the VM from
    pub vm_template: String,

    /// VM network to connect the first adapter to
    pub vm_network: String,

    /// Hardware profile to apply
    pub hardware_profile: String,

    /// Free-form description stored on the VM
    pub description: String,

    /// Memory as a quantity (e.g. "4Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Number of virtual CPUs
    pub cpu_count: i64,

    /// Virtual disks, in controller order
    pub disks: Vec<VmDisk>,

    /// SCVMM automatic start action
    pub start_action: String,

    /// SCVMM automatic stop action
    pub stop_action: String,

    /// Active Directory computer object to pre-create
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_directory: Option<ActiveDirectorySpec>,

    /// Inline cloud-init data; its presence marks a standalone machine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitSpec>,

    /// Structured network settings, may be filled in by the remote side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,

    /// Provider configuration for standalone machines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<ProviderReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VmDisk {
    /// Target size as a quantity; absent keeps the template size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Virtual hard disk in the library to copy
    pub vh_disk: String,

    /// Dynamically expanding (thin) instead of fixed size
    pub dynamic: bool,
}

impl VmDisk {
    /// Target size in bytes, zero when unset
    pub fn size_bytes(&self) -> Result<i64, QuantityError> {
        optional_quantity(self.size.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ActiveDirectorySpec {
    /// OU to create the computer object in
    #[serde(rename = "ouPath")]
    pub ou_path: String,

    /// Domain controller to talk to; empty uses the provider default
    pub domain_controller: String,

    /// Description of the computer object
    pub description: String,

    /// Groups the computer object is added to
    pub member_of: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudInitSpec {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkingSpec {
    /// DNS domain of the machine
    pub domain: String,

    /// Per-adapter settings
    pub devices: Vec<NetworkDevice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkDevice {
    /// Interface name inside the guest (e.g. "eth0")
    pub device_name: String,

    /// Addresses in CIDR notation
    pub ip_addresses: Vec<String>,

    pub gateway: String,

    pub nameservers: Vec<String>,

    pub search_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScvmmMachineStatus {
    /// The VM is running
    #[serde(default)]
    pub ready: bool,

    /// Last seen SCVMM status string ("PowerOff", "Running", ...)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bios_guid: String,

    #[serde(default, rename = "vmId", skip_serializing_if = "String::is_empty")]
    pub vm_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Address of the machine as reported by the guest
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    Hostname,
    ExternalIP,
    InternalIP,
    ExternalDNS,
    InternalDNS,
}

impl ScvmmMachine {
    /// Status, created empty on first access
    pub fn status_mut(&mut self) -> &mut ScvmmMachineStatus {
        self.status.get_or_insert_with(ScvmmMachineStatus::default)
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|name| name == MACHINE_FINALIZER))
    }

    /// Add the machine finalizer; returns false if it was already present
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(MACHINE_FINALIZER.to_string());
        true
    }

    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|name| name != MACHINE_FINALIZER);
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

impl ScvmmMachineSpec {
    /// Memory in bytes, zero when unset
    pub fn memory_bytes(&self) -> Result<i64, QuantityError> {
        optional_quantity(self.memory.as_deref())
    }

    /// Overwrite fields of `self` with every non-zero field of `echoed`
    ///
    /// Strings are zero when empty, numbers when 0, options when `None` and
    /// lists when empty. Returns whether any field of `self` actually changed.
    pub fn merge_non_zero(&mut self, echoed: &ScvmmMachineSpec) -> bool {
        let mut changed = false;

        merge_option(&mut self.provider_id, &echoed.provider_id, &mut changed);
        merge_string(&mut self.vm_name, &echoed.vm_name, &mut changed);
        merge_string(&mut self.cloud, &echoed.cloud, &mut changed);
        merge_string(&mut self.host_group, &echoed.host_group, &mut changed);
        merge_string(&mut self.vm_template, &echoed.vm_template, &mut changed);
        merge_string(&mut self.vm_network, &echoed.vm_network, &mut changed);
        merge_string(&mut self.hardware_profile, &echoed.hardware_profile, &mut changed);
        merge_string(&mut self.description, &echoed.description, &mut changed);
        merge_option(&mut self.memory, &echoed.memory, &mut changed);
        if echoed.cpu_count != 0 && self.cpu_count != echoed.cpu_count {
            self.cpu_count = echoed.cpu_count;
            changed = true;
        }
        merge_vec(&mut self.disks, &echoed.disks, &mut changed);
        merge_string(&mut self.start_action, &echoed.start_action, &mut changed);
        merge_string(&mut self.stop_action, &echoed.stop_action, &mut changed);
        merge_option(&mut self.active_directory, &echoed.active_directory, &mut changed);
        merge_option(&mut self.cloud_init, &echoed.cloud_init, &mut changed);
        merge_option(&mut self.networking, &echoed.networking, &mut changed);
        merge_option(&mut self.provider_ref, &echoed.provider_ref, &mut changed);

        changed
    }
}

fn merge_string(target: &mut String, source: &str, changed: &mut bool) {
    if !source.is_empty() && target != source {
        *target = source.to_string();
        *changed = true;
    }
}

fn merge_option<T: Clone + PartialEq>(target: &mut Option<T>, source: &Option<T>, changed: &mut bool) {
    if let Some(value) = source {
        if target.as_ref() != Some(value) {
            *target = Some(value.clone());
            *changed = true;
        }
    }
}

fn merge_vec<T: Clone + PartialEq>(target: &mut Vec<T>, source: &[T], changed: &mut bool) {
    if !source.is_empty() && target.as_slice() != source {
        *target = source.to_vec();
        *changed = true;
    }
}
