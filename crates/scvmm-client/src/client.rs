//! SCVMM client
//!
//! Implements the typed remote calls on top of a [`WinRmSession`].

use crate::error::ScvmmError;
use crate::models::{AdComputerRequest, CloudInitMedia, CreateVmRequest, DiskParameter};
use crate::protocol::{
    decode_result, decode_spec_result, CommandLine, CommandOutput, SpecPayload, VmResult,
    VmSpecResult,
};
use crate::scvmm_trait::{ScvmmClientTrait, ScvmmConnector};
use crate::session::{SessionConfig, WinRmSession};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::Mutex;
use tracing::debug;

/// Client bound to one open session
#[derive(Debug)]
pub struct ScvmmClient {
    session: Mutex<WinRmSession>,
    extra_debug: bool,
}

impl ScvmmClient {
    /// Open and seed a session
    pub async fn connect(config: &SessionConfig) -> Result<Self, ScvmmError> {
        let session = WinRmSession::open(config).await?;
        Ok(Self {
            session: Mutex::new(session),
            extra_debug: config.extra_debug,
        })
    }

    async fn run(&self, line: &CommandLine, log_line: bool) -> Result<CommandOutput, ScvmmError> {
        if self.extra_debug && log_line {
            debug!("Sending WinRM command {}: {}", line.function(), line);
        } else if self.extra_debug {
            debug!("Sending WinRM command {}", line.function());
        }
        let output = self.session.lock().await.invoke(line.as_str()).await?;
        if self.extra_debug {
            debug!(
                "Got WinRM result of {}: stdout={} stderr={}",
                line.function(),
                output.stdout,
                output.stderr
            );
        }
        Ok(output)
    }

    /// Plain call, decoded as [`VmResult`]
    pub async fn call(&self, line: CommandLine) -> Result<VmResult, ScvmmError> {
        decode_result(&self.run(&line, true).await?)
    }

    /// Spec call, decoded as [`VmSpecResult`]
    pub async fn call_spec(&self, function: &str, payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError> {
        decode_spec_result(&self.run(&payload.command(function), true).await?)
    }
}

fn disks_json(disks: &[DiskParameter]) -> Result<String, ScvmmError> {
    Ok(serde_json::to_string(disks)?)
}

#[async_trait::async_trait]
impl ScvmmClientTrait for ScvmmClient {
    async fn get_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.call(CommandLine::new("GetVM").arg_str("VMName", vm_name)).await
    }

    async fn read_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.call(CommandLine::new("ReadVM").arg_str("VMName", vm_name)).await
    }

    async fn generate_vm_name(&self, payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError> {
        self.call_spec("GenerateVMName", payload).await
    }

    async fn add_vm_spec(&self, payload: &SpecPayload) -> Result<VmSpecResult, ScvmmError> {
        self.call_spec("AddVMSpec", payload).await
    }

    async fn create_ad_computer(&self, request: &AdComputerRequest) -> Result<VmResult, ScvmmError> {
        self.call(
            CommandLine::new("CreateADComputer")
                .arg_str("Name", &request.name)
                .arg_str("OUPath", &request.ou_path)
                .arg_str("DomainController", &request.domain_controller)
                .arg_str("Description", &request.description)
                .arg_array("MemberOf", &request.member_of),
        )
        .await
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmResult, ScvmmError> {
        self.call(
            CommandLine::new("CreateVM")
                .arg_str("Cloud", &request.cloud)
                .arg_str("HostGroup", &request.host_group)
                .arg_str("VMName", &request.vm_name)
                .arg_str("VMTemplate", &request.vm_template)
                .arg_int("Memory", request.memory_mb)
                .arg_int("CPUCount", request.cpu_count)
                .arg_str("Disks", &disks_json(&request.disks)?)
                .arg_str("VMNetwork", &request.vm_network)
                .arg_str("HardwareProfile", &request.hardware_profile)
                .arg_str("Description", &request.description)
                .arg_str("StartAction", &request.start_action)
                .arg_str("StopAction", &request.stop_action),
        )
        .await
    }

    async fn expand_vm_disks(&self, vm_name: &str, disks: &[DiskParameter]) -> Result<VmResult, ScvmmError> {
        self.call(
            CommandLine::new("ExpandVMDisks")
                .arg_str("VMName", vm_name)
                .arg_str("Disks", &disks_json(disks)?),
        )
        .await
    }

    async fn write_cloud_init_iso(&self, iso_path: &str, media: &CloudInitMedia) -> Result<VmResult, ScvmmError> {
        let line = CommandLine::new("WriteCloudInitIso")
            .arg_str("ISOPath", iso_path)
            .arg_str("UserData", &STANDARD.encode(&media.user_data))
            .arg_str("MetaData", &STANDARD.encode(&media.meta_data))
            .arg_str("NetworkConfig", &STANDARD.encode(&media.network_config));
        // User data may carry secrets, keep it out of the log
        decode_result(&self.run(&line, false).await?)
    }

    async fn add_iso_to_vm(&self, vm_name: &str, iso_path: &str) -> Result<VmResult, ScvmmError> {
        self.call(
            CommandLine::new("AddIsoToVM")
                .arg_str("VMName", vm_name)
                .arg_str("ISOPath", iso_path),
        )
        .await
    }

    async fn start_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.call(CommandLine::new("StartVM").arg_str("VMName", vm_name)).await
    }

    async fn remove_vm(&self, vm_name: &str) -> Result<VmResult, ScvmmError> {
        self.call(CommandLine::new("RemoveVM").arg_str("VMName", vm_name)).await
    }

    async fn remove_ad_computer(&self, request: &AdComputerRequest) -> Result<VmResult, ScvmmError> {
        self.call(
            CommandLine::new("RemoveADComputer")
                .arg_str("Name", &request.name)
                .arg_str("OUPath", &request.ou_path)
                .arg_str("DomainController", &request.domain_controller),
        )
        .await
    }

    async fn close(&self) {
        self.session.lock().await.close().await;
    }
}

/// Connector opening real WinRM sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct WinRmConnector;

#[async_trait::async_trait]
impl ScvmmConnector for WinRmConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Box<dyn ScvmmClientTrait>, ScvmmError> {
        Ok(Box::new(ScvmmClient::connect(config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disks_json_shape() {
        let json = disks_json(&[
            DiskParameter {
                size_mb: 20480,
                vh_disk: String::new(),
                dynamic: true,
            },
            DiskParameter {
                size_mb: 0,
                vh_disk: "blank.vhdx".to_string(),
                dynamic: false,
            },
        ])
        .unwrap();
        assert_eq!(
            json,
            r#"[{"sizeMB":20480,"dynamic":true},{"sizeMB":0,"vhDisk":"blank.vhdx","dynamic":false}]"#
        );
    }
}
