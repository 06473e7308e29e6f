//! Access to the management cluster
//!
//! The reconciler reads its dependencies and persists the machine only
//! through [`ResourceStore`], so the state machine can be exercised against
//! an in-memory store in tests.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{Cluster, Machine, ScvmmCluster, ScvmmMachine, ScvmmProvider};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

/// Field manager used for every patch
pub const FIELD_MANAGER: &str = "scvmm-machine-controller";

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError>;

    async fn cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError>;

    async fn scvmm_cluster(&self, namespace: &str, name: &str) -> Result<Option<ScvmmCluster>, ControllerError>;

    async fn provider(&self, namespace: &str, name: &str) -> Result<Option<ScvmmProvider>, ControllerError>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError>;

    /// Persist status, finalizers and spec of the machine
    async fn patch_machine(&self, machine: &ScvmmMachine) -> Result<(), ControllerError>;
}

/// Store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ControllerError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError> {
        self.get(namespace, name).await
    }

    async fn cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError> {
        self.get(namespace, name).await
    }

    async fn scvmm_cluster(&self, namespace: &str, name: &str) -> Result<Option<ScvmmCluster>, ControllerError> {
        self.get(namespace, name).await
    }

    async fn provider(&self, namespace: &str, name: &str) -> Result<Option<ScvmmProvider>, ControllerError> {
        self.get(namespace, name).await
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError> {
        self.get(namespace, name).await
    }

    async fn patch_machine(&self, machine: &ScvmmMachine) -> Result<(), ControllerError> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or("default");
        let name = machine
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::Reconciliation("ScvmmMachine has no name".to_string()))?;
        let api: Api<ScvmmMachine> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER);

        // Status first: dropping the last finalizer may delete the object
        if let Some(status) = &machine.status {
            debug!("Patching status of ScvmmMachine {}/{}", namespace, name);
            api.patch_status(name, &params, &Patch::Merge(json!({ "status": status })))
                .await?;
        }

        let patch = json!({
            "metadata": { "finalizers": machine.metadata.finalizers.clone().unwrap_or_default() },
            "spec": machine.spec,
        });
        debug!("Patching ScvmmMachine {}/{}", namespace, name);
        api.patch(name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }
}
