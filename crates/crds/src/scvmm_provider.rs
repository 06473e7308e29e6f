//! ScvmmProvider CRD
//!
//! Connection settings for one SCVMM installation: where to run remote
//! commands, which credentials to use and optional extra remote functions.

use crate::references::SecretReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ScvmmProvider",
    namespaced,
    shortname = "scvmmp",
    category = "cluster-api"
)]
#[serde(rename_all = "camelCase", default)]
pub struct ScvmmProviderSpec {
    /// SCVMM management server
    pub scvmm_host: String,

    /// Windows host the remote shell is opened on; defaults to the SCVMM host
    pub exec_host: String,

    /// Library share cloud-init ISOs are written to
    #[serde(rename = "scvmmLibraryISOs")]
    pub scvmm_library_isos: String,

    /// Default domain controller for Active Directory operations
    pub ad_server: String,

    /// Secret with "username" and "password" keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// Additional remote functions, overriding bundled ones by name
    pub extra_functions: BTreeMap<String, String>,
}
