//! Bootstrap data and cloud-init media
//!
//! A machine owned by a Cluster API `Machine` boots from the user-data in the
//! bootstrap secret; a standalone machine carries its cloud-init inline. The
//! media written for the VM is the NoCloud file set, with meta-data and
//! network-config synthesised when the source leaves them out.

use crate::error::ControllerError;
use crds::{CloudInitSpec, NetworkingSpec, ScvmmMachineSpec};
use k8s_openapi::api::core::v1::Secret;
use scvmm_client::CloudInitMedia;
use serde::Serialize;
use std::collections::BTreeMap;

/// Key of the bootstrap secret holding the user-data
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// User-data from a Cluster API bootstrap secret
pub fn secret_user_data(secret: &Secret) -> Result<String, ControllerError> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(BOOTSTRAP_DATA_KEY))
        .ok_or_else(|| {
            ControllerError::Bootstrap(format!("secret {} has no '{}' key", name, BOOTSTRAP_DATA_KEY))
        })?;
    String::from_utf8(bytes.0.clone())
        .map_err(|e| ControllerError::Bootstrap(format!("secret {} is not valid UTF-8: {}", name, e)))
}

/// Payloads supplied inline on a standalone machine
pub fn inline_media(cloud_init: &CloudInitSpec) -> CloudInitMedia {
    CloudInitMedia {
        user_data: cloud_init.user_data.clone(),
        meta_data: cloud_init.meta_data.clone(),
        network_config: cloud_init.network_config.clone(),
    }
}

/// Fill in meta-data and network-config the source did not supply
pub fn complete_media(
    mut media: CloudInitMedia,
    spec: &ScvmmMachineSpec,
    vm_id: &str,
) -> Result<CloudInitMedia, ControllerError> {
    if media.meta_data.is_empty() {
        media.meta_data = default_meta_data(vm_id, &spec.vm_name);
    }
    if media.network_config.is_empty() {
        if let Some(networking) = &spec.networking {
            media.network_config = render_network_config(networking)?;
        }
    }
    Ok(media)
}

pub fn default_meta_data(vm_id: &str, vm_name: &str) -> String {
    let instance_id = if vm_id.is_empty() { vm_name } else { vm_id };
    format!("instance-id: {}\nlocal-hostname: {}\n", instance_id, vm_name)
}

#[derive(Debug, Serialize)]
struct NetplanConfig {
    version: u8,
    ethernets: BTreeMap<String, NetplanEthernet>,
}

#[derive(Debug, Default, Serialize)]
struct NetplanEthernet {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<NetplanRoute>,
    #[serde(skip_serializing_if = "NetplanNameservers::is_empty")]
    nameservers: NetplanNameservers,
}

#[derive(Debug, Serialize)]
struct NetplanRoute {
    to: String,
    via: String,
}

#[derive(Debug, Default, Serialize)]
struct NetplanNameservers {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    search: Vec<String>,
}

impl NetplanNameservers {
    fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.search.is_empty()
    }
}

/// Netplan v2 network-config for the structured networking spec
///
/// Devices without a name become `eth<index>`. The machine domain is
/// appended to every device's search list.
pub fn render_network_config(networking: &NetworkingSpec) -> Result<String, ControllerError> {
    let mut ethernets = BTreeMap::new();
    for (index, device) in networking.devices.iter().enumerate() {
        let name = if device.device_name.is_empty() {
            format!("eth{}", index)
        } else {
            device.device_name.clone()
        };

        let mut search = device.search_domains.clone();
        if !networking.domain.is_empty() && !search.contains(&networking.domain) {
            search.push(networking.domain.clone());
        }

        let routes = if device.gateway.is_empty() {
            Vec::new()
        } else {
            vec![NetplanRoute {
                to: "default".to_string(),
                via: device.gateway.clone(),
            }]
        };

        ethernets.insert(
            name,
            NetplanEthernet {
                addresses: device.ip_addresses.clone(),
                routes,
                nameservers: NetplanNameservers {
                    addresses: device.nameservers.clone(),
                    search,
                },
            },
        );
    }

    Ok(serde_yaml::to_string(&NetplanConfig { version: 2, ethernets })?)
}
