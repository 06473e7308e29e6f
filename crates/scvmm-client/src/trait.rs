//! ScvmmClientTrait for mocking
//!
//! The reconciler talks to SCVMM only through these traits, so unit tests
//! can run the whole state machine against an in-memory implementation.

use crate::error::ScvmmError;
use crate::models::{AdComputerRequest, CloudInitMedia, CreateVmRequest, DiskParameter};
use crate::protocol::{SpecPayload, VmResult, VmSpecResult};
use crate::session::SessionConfig;

/// Typed remote calls over one open session
///
/// `Ok` means the call ran and its answer decoded; the remote function's
/// own failure is reported through [`VmResult::failure`].
#[async_trait::async_trait]
pub trait ScvmmClientTrait: Send + Sync {
    /// Look up a VM by name; a result with an empty name means not found
    async fn get_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError>;

    /// Like `get_vm`, also refreshing guest information (addresses, hostname)
    async fn read_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError>;

    /// Let the remote side pick a VM name for the spec
    async fn generate_vm_name(&self, payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError>;

    /// Let the remote side fill in derived spec fields
    async fn add_vm_spec(&self, payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError>;

    async fn create_ad_computer(&self, request: &AdComputerRequest) -> Result<VmResult, ScvmmError>;

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmResult, ScvmmError>;

    async fn expand_vm_disks(&self, vm_name: &str, disks: &[DiskParameter]) -> Result<VmResult, ScvmmError>;

    /// Write a NoCloud ISO to `iso_path` on the library share
    async fn write_cloud_init_iso(&self, iso_path: &str, media: &CloudInitMedia) -> Result<VmResult, ScvmmError>;

    /// Attach an ISO to the VM's DVD drive and start it
    async fn add_iso_to_vm(&self, vm_name: &str, iso_path: &str) -> Result<VmResult, ScvmmError>;

    async fn start_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError>;

    /// Remove the VM; the message "Removed" signals completion
    async fn remove_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError>;

    async fn remove_ad_computer(&self, request: &AdComputerRequest) -> Result<VmResult, ScvmmError>;

    /// End the session; idempotent
    async fn close(&self);
}

/// Opens sessions
#[async_trait::async_trait]
pub trait ScvmmConnector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn ScvmmClientTrait>, ScvmmError>;
}
