//! Request models for the typed remote calls

use serde::{Deserialize, Serialize};

/// One disk as passed to `CreateVM` and `ExpandVMDisks` in the `-Disks` JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskParameter {
    #[serde(rename = "sizeMB")]
    pub size_mb: i64,
    #[serde(rename = "vhDisk", default, skip_serializing_if = "String::is_empty")]
    pub vh_disk: String,
    pub dynamic: bool,
}

/// Parameters of `CreateVM`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVmRequest {
    pub cloud: String,
    pub host_group: String,
    pub vm_name: String,
    pub vm_template: String,
    pub memory_mb: i64,
    pub cpu_count: i64,
    pub disks: Vec<DiskParameter>,
    pub vm_network: String,
    pub hardware_profile: String,
    pub description: String,
    pub start_action: String,
    pub stop_action: String,
}

/// Active Directory computer object to create or remove
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdComputerRequest {
    pub name: String,
    pub ou_path: String,
    pub domain_controller: String,
    pub description: String,
    pub member_of: Vec<String>,
}

/// NoCloud file set written into a cloud-init ISO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInitMedia {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl CloudInitMedia {
    pub fn is_empty(&self) -> bool {
        self.user_data.is_empty() && self.meta_data.is_empty() && self.network_config.is_empty()
    }
}
