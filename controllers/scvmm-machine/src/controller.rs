//! Main controller implementation.
//!
//! Wires the Kubernetes client, the WinRM connector and the reconciler
//! together and keeps the ScvmmMachine watcher running.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::store::KubeStore;
use crate::watcher::Watcher;
use crds::{Cluster, Machine, ScvmmCluster, ScvmmMachine};
use kube::{Api, Client};
use scvmm_client::{FunctionLibrary, WinRmConnector};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for ScvmmMachine resources.
pub struct Controller {
    scvmm_machine_watcher: JoinHandle<Result<(), ControllerError>>,
}

/// Api for `K` in the watched namespace, or cluster-wide
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

impl Controller {
    /// Creates a new controller instance and starts its watcher.
    pub async fn new(config: ControllerConfig, library: FunctionLibrary) -> Result<Self, ControllerError> {
        info!("Initializing ScvmmMachine Controller");

        let kube_client = Client::try_default().await?;

        let namespace = config.namespace.clone();
        let ns = namespace.as_deref();
        let scvmm_machine_api: Api<ScvmmMachine> = scoped_api(&kube_client, ns);
        let machine_api: Api<Machine> = scoped_api(&kube_client, ns);
        let cluster_api: Api<Cluster> = scoped_api(&kube_client, ns);
        let scvmm_cluster_api: Api<ScvmmCluster> = scoped_api(&kube_client, ns);

        let reconciler = Reconciler::new(
            KubeStore::new(kube_client.clone()),
            WinRmConnector,
            config,
            library,
        );

        let watcher_instance = Arc::new(Watcher::new(
            Arc::new(reconciler),
            scvmm_machine_api,
            machine_api,
            cluster_api,
            scvmm_cluster_api,
        ));

        let scvmm_machine_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_scvmm_machines().await })
        };

        Ok(Self { scvmm_machine_watcher })
    }

    /// Runs until the watcher exits or a shutdown signal arrives.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("ScvmmMachine Controller running");

        tokio::select! {
            result = &mut self.scvmm_machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("ScvmmMachine watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("ScvmmMachine watcher error: {}", e)))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping ScvmmMachine Controller");
                self.scvmm_machine_watcher.abort();
            }
        }

        Ok(())
    }
}
