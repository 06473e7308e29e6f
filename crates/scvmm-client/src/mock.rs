//! Mock ScvmmClient for unit testing
//!
//! Keeps VMs in memory and records every call, so reconciler tests can
//! assert which remote operations an attempt issued. Clones share state:
//! a test keeps one handle while the [`MockConnector`] hands out others.

use crate::error::ScvmmError;
use crate::models::{AdComputerRequest, CloudInitMedia, CreateVmRequest, DiskParameter};
use crate::protocol::{SpecPayload, VirtualDiskInfo, VmResult, VmSpecResult};
use crate::scvmm_trait::{ScvmmClientTrait, ScvmmConnector};
use crate::session::SessionConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

const MEBIBYTE: i64 = 1024 * 1024;

/// Disk size of a created VM when the request leaves it at zero
pub const TEMPLATE_DISK_BYTES: i64 = 10 * 1024 * MEBIBYTE;

/// Mock ScvmmClient for testing
#[derive(Debug, Clone, Default)]
pub struct MockScvmmClient {
    pub(crate) vms: Arc<Mutex<HashMap<String, VmResult>>>,
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    /// Function name -> structured error to report
    pub(crate) failures: Arc<Mutex<HashMap<String, String>>>,
    /// Function names that fail at the transport level
    pub(crate) transport_failures: Arc<Mutex<HashSet<String>>>,
    /// Spec fields echoed by AddVMSpec
    pub(crate) spec_echo: Arc<Mutex<serde_json::Map<String, serde_json::Value>>>,
    pub(crate) media: Arc<Mutex<Vec<(String, CloudInitMedia)>>>,
    pub(crate) ad_computers: Arc<Mutex<HashSet<String>>>,
    pub(crate) removal_in_progress: Arc<Mutex<bool>>,
    pub(crate) next_name: Arc<Mutex<u32>>,
    pub(crate) closed: Arc<Mutex<u32>>,
}

impl MockScvmmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a VM in place as if it already existed remotely
    pub fn insert_vm(&self, vm: VmResult) {
        self.vms.lock().unwrap().insert(vm.name.clone(), vm);
    }

    pub fn vm(&self, name: &str) -> Option<VmResult> {
        self.vms.lock().unwrap().get(name).cloned()
    }

    pub fn set_vm_status(&self, name: &str, status: &str) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(name) {
            vm.status = status.to_string();
        }
    }

    /// Let `function` answer with a structured error
    pub fn fail_with(&self, function: &str, error: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(function.to_string(), error.to_string());
    }

    /// Let `function` fail as if the session broke
    pub fn fail_transport(&self, function: &str) {
        self.transport_failures.lock().unwrap().insert(function.to_string());
    }

    pub fn set_spec_echo(&self, echo: serde_json::Value) {
        if let serde_json::Value::Object(map) = echo {
            *self.spec_echo.lock().unwrap() = map;
        }
    }

    /// Keep RemoveVM reporting "in progress" instead of "Removed"
    pub fn set_removal_in_progress(&self, in_progress: bool) {
        *self.removal_in_progress.lock().unwrap() = in_progress;
    }

    pub fn add_ad_computer(&self, name: &str) {
        self.ad_computers.lock().unwrap().insert(name.to_string());
    }

    pub fn has_ad_computer(&self, name: &str) -> bool {
        self.ad_computers.lock().unwrap().contains(name)
    }

    /// Function names called so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, function: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == function).count()
    }

    /// Calls that change remote state
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c.as_str(), "GetVM" | "ReadVM" | "GenerateVMName" | "AddVMSpec"))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Media written by WriteCloudInitIso, with the ISO path
    pub fn written_media(&self) -> Vec<(String, CloudInitMedia)> {
        self.media.lock().unwrap().clone()
    }

    /// Number of times a session was closed
    pub fn close_count(&self) -> u32 {
        *self.closed.lock().unwrap()
    }

    fn record(&self, function: &str) -> Result<Option<String>, ScvmmError> {
        self.calls.lock().unwrap().push(function.to_string());
        if self.transport_failures.lock().unwrap().contains(function) {
            return Err(ScvmmError::Transport(format!("{function}: connection reset")));
        }
        Ok(self.failures.lock().unwrap().get(function).cloned())
    }

    fn failed(error: String) -> VmResult {
        VmResult {
            error,
            message: "failed".to_string(),
            ..Default::default()
        }
    }

    fn lookup(&self, function: &str, vm_name: &str) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record(function)? {
            return Ok(Self::failed(error));
        }
        Ok(self.vm(vm_name).unwrap_or_default())
    }

    fn update(&self, function: &str, vm_name: &str, f: impl FnOnce(&mut VmResult)) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record(function)? {
            return Ok(Self::failed(error));
        }
        let mut vms = self.vms.lock().unwrap();
        match vms.get_mut(vm_name) {
            Some(vm) => {
                f(vm);
                Ok(vm.clone())
            }
            None => Ok(Self::failed(format!("VM {vm_name} not found"))),
        }
    }
}

#[async_trait::async_trait]
impl ScvmmClientTrait for MockScvmmClient {
    async fn get_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.lookup("GetVM", vm_name)
    }

    async fn read_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.lookup("ReadVM", vm_name)
    }

    async fn generate_vm_name(&self, _payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError> {
        if let Some(error) = self.record("GenerateVMName")? {
            return Ok(VmSpecResult {
                error,
                ..Default::default()
            });
        }
        let mut next = self.next_name.lock().unwrap();
        *next += 1;
        let mut spec = serde_json::Map::new();
        spec.insert("vmName".to_string(), serde_json::json!(format!("vm-{:03}", *next)));
        Ok(VmSpecResult {
            message: "generated".to_string(),
            spec,
            ..Default::default()
        })
    }

    async fn add_vm_spec(&self, _payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError> {
        if let Some(error) = self.record("AddVMSpec")? {
            return Ok(VmSpecResult {
                error,
                ..Default::default()
            });
        }
        Ok(VmSpecResult {
            spec: self.spec_echo.lock().unwrap().clone(),
            ..Default::default()
        })
    }

    async fn create_ad_computer(&self, request: &AdComputerRequest) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record("CreateADComputer")? {
            return Ok(Self::failed(error));
        }
        self.add_ad_computer(&request.name);
        Ok(VmResult {
            message: "Created".to_string(),
            ..Default::default()
        })
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record("CreateVM")? {
            return Ok(Self::failed(error));
        }
        let virtual_disks = request
            .disks
            .iter()
            .map(|d| {
                let size = if d.size_mb > 0 { d.size_mb * MEBIBYTE } else { TEMPLATE_DISK_BYTES };
                VirtualDiskInfo {
                    size: 4 * MEBIBYTE,
                    maximum_size: size,
                }
            })
            .collect();
        let vm = VmResult {
            cloud: request.cloud.clone(),
            name: request.vm_name.clone(),
            status: "UnderCreation".to_string(),
            memory: request.memory_mb,
            cpu_count: request.cpu_count,
            virtual_network: request.vm_network.clone(),
            virtual_disks,
            bios_guid: format!("bios-{}", request.vm_name),
            id: format!("id-{}", request.vm_name),
            vm_id: format!("vmid-{}", request.vm_name),
            message: "Created".to_string(),
            ..Default::default()
        };
        let mut created = vm.clone();
        // Creation finishes in the background
        created.status = "PowerOff".to_string();
        self.insert_vm(created);
        Ok(vm)
    }

    async fn expand_vm_disks(&self, vm_name: &str, disks: &[DiskParameter]) -> Result<VmResult, ScvmmError> {
        self.update("ExpandVMDisks", vm_name, |vm| {
            for (remote, wanted) in vm.virtual_disks.iter_mut().zip(disks) {
                let wanted = wanted.size_mb * MEBIBYTE;
                if wanted > remote.maximum_size {
                    remote.maximum_size = wanted;
                }
            }
        })
    }

    async fn write_cloud_init_iso(&self, iso_path: &str, media: &CloudInitMedia) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record("WriteCloudInitIso")? {
            return Ok(Self::failed(error));
        }
        self.media
            .lock()
            .unwrap()
            .push((iso_path.to_string(), media.clone()));
        Ok(VmResult {
            message: "Written".to_string(),
            ..Default::default()
        })
    }

    async fn add_iso_to_vm(&self, vm_name: &str, _iso_path: &str) -> Result<VmResult, ScvmmError> {
        self.update("AddIsoToVM", vm_name, |vm| vm.status = "Running".to_string())
    }

    async fn start_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.update("StartVM", vm_name, |vm| vm.status = "Running".to_string())
    }

    async fn remove_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record("RemoveVM")? {
            return Ok(Self::failed(error));
        }
        if *self.removal_in_progress.lock().unwrap() {
            let mut vm = self.vm(vm_name).unwrap_or_default();
            vm.status = "Deleting".to_string();
            vm.message = "Removing".to_string();
            return Ok(vm);
        }
        self.vms.lock().unwrap().remove(vm_name);
        Ok(VmResult {
            message: "Removed".to_string(),
            ..Default::default()
        })
    }

    async fn remove_ad_computer(&self, request: &AdComputerRequest) -> Result<VmResult, ScvmmError> {
        if let Some(error) = self.record("RemoveADComputer")? {
            return Ok(Self::failed(error));
        }
        self.ad_computers.lock().unwrap().remove(&request.name);
        Ok(VmResult {
            message: "Removed".to_string(),
            ..Default::default()
        })
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() += 1;
    }
}

/// Connector handing out clones of one mock client
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub client: MockScvmmClient,
    pub(crate) connects: Arc<Mutex<Vec<SessionConfig>>>,
    pub(crate) fail_connect: Arc<Mutex<Option<String>>>,
}

impl MockConnector {
    pub fn new(client: MockScvmmClient) -> Self {
        Self {
            client,
            ..Default::default()
        }
    }

    /// Make every connect attempt fail with a transport error
    pub fn fail_connect(&self, message: &str) {
        *self.fail_connect.lock().unwrap() = Some(message.to_string());
    }

    /// Configurations sessions were opened with
    pub fn connects(&self) -> Vec<SessionConfig> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ScvmmConnector for MockConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn ScvmmClientTrait>, ScvmmError> {
        self.connects.lock().unwrap().push(config.clone());
        if let Some(message) = self.fail_connect.lock().unwrap().clone() {
            return Err(ScvmmError::Transport(message));
        }
        Ok(Box::new(self.client.clone()))
    }
}
