//! ScvmmCluster CRD
//!
//! Infrastructure cluster object. The machine controller only reads the
//! provider reference from it.

use crate::conditions::Condition;
use crate::references::ProviderReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ScvmmCluster",
    namespaced,
    status = "ScvmmClusterStatus",
    shortname = "scvmmc",
    category = "cluster-api"
)]
#[serde(rename_all = "camelCase")]
pub struct ScvmmClusterSpec {
    /// Provider configuration shared by all machines of the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<ProviderReference>,

    /// Endpoint of the cluster API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScvmmClusterStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
