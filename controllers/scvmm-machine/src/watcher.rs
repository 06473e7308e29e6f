//! Kubernetes resource watchers.
//!
//! ScvmmMachines are reconciled through `kube_runtime::Controller`. Changes
//! to related objects are mapped back onto the machines they affect:
//! - Machine: its `infrastructureRef` when it points at an ScvmmMachine
//! - Cluster / ScvmmCluster: every ScvmmMachine labelled with that cluster

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{Cluster, Machine, ScvmmCluster, ScvmmMachine, CLUSTER_API_GROUP, CLUSTER_NAME_LABEL};
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Kind an owning Machine uses to reference us
const SCVMM_MACHINE_KIND: &str = "ScvmmMachine";

async fn reconcile(machine: Arc<ScvmmMachine>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    debug!("Reconciling ScvmmMachine {:?}/{}", machine.namespace(), machine.name_any());
    let requeue = ctx.reconcile_machine(&machine).await?;
    ctx.reset_error(&machine);
    Ok(requeue.into_action())
}

fn error_policy(machine: Arc<ScvmmMachine>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    error!(
        "Reconciliation error for ScvmmMachine {:?}/{}: {}",
        machine.namespace(),
        machine.name_any(),
        error
    );
    ctx.error_action(&machine, error)
}

/// ScvmmMachine referenced by a Machine's `infrastructureRef`
pub fn machine_to_scvmm_machine(machine: &Machine) -> Option<ObjectRef<ScvmmMachine>> {
    let infra = &machine.spec.infrastructure_ref;
    if infra.kind.as_deref() != Some(SCVMM_MACHINE_KIND) || infra.name.is_empty() {
        return None;
    }
    let namespace = infra
        .namespace
        .clone()
        .or_else(|| machine.namespace())
        .unwrap_or_default();
    Some(ObjectRef::new(&infra.name).within(&namespace))
}

/// Cluster name an ScvmmCluster belongs to: its cluster label, else an owning Cluster
pub fn scvmm_cluster_name(scvmm_cluster: &ScvmmCluster) -> Option<String> {
    if let Some(name) = scvmm_cluster.labels().get(CLUSTER_NAME_LABEL) {
        return Some(name.clone());
    }
    scvmm_cluster
        .owner_references()
        .iter()
        .find(|owner| owner.kind == "Cluster" && owner.api_version.starts_with(CLUSTER_API_GROUP))
        .map(|owner| owner.name.clone())
}

/// ScvmmMachines in `namespace` labelled with `cluster_name`
pub fn machines_in_cluster(
    machines: &[Arc<ScvmmMachine>],
    namespace: Option<&str>,
    cluster_name: &str,
) -> Vec<ObjectRef<ScvmmMachine>> {
    machines
        .iter()
        .filter(|machine| machine.namespace().as_deref() == namespace)
        .filter(|machine| machine.labels().get(CLUSTER_NAME_LABEL).map(String::as_str) == Some(cluster_name))
        .map(|machine| ObjectRef::from_obj(machine.as_ref()))
        .collect()
}

/// Watches ScvmmMachines and the objects they depend on.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    scvmm_machine_api: Api<ScvmmMachine>,
    machine_api: Api<Machine>,
    cluster_api: Api<Cluster>,
    scvmm_cluster_api: Api<ScvmmCluster>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        scvmm_machine_api: Api<ScvmmMachine>,
        machine_api: Api<Machine>,
        cluster_api: Api<Cluster>,
        scvmm_cluster_api: Api<ScvmmCluster>,
    ) -> Self {
        Self {
            reconciler,
            scvmm_machine_api,
            machine_api,
            cluster_api,
            scvmm_cluster_api,
        }
    }

    /// Runs the ScvmmMachine controller until the watch stream ends.
    pub async fn watch_scvmm_machines(&self) -> Result<(), ControllerError> {
        info!("Starting ScvmmMachine watcher");

        // Debounce batches bursts of status updates; concurrency bounds open WinRM sessions
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(5))
            .concurrency(3);

        let controller = Controller::new(self.scvmm_machine_api.clone(), watcher::Config::default());
        let cluster_store = controller.store();
        let scvmm_cluster_store = controller.store();

        controller
            .with_config(controller_config)
            .watches(self.machine_api.clone(), watcher::Config::default(), |machine: Machine| {
                machine_to_scvmm_machine(&machine)
            })
            .watches(self.cluster_api.clone(), watcher::Config::default(), move |cluster: Cluster| {
                fan_out(&cluster_store, cluster.namespace().as_deref(), Some(cluster.name_any()))
            })
            .watches(
                self.scvmm_cluster_api.clone(),
                watcher::Config::default(),
                move |scvmm_cluster: ScvmmCluster| {
                    fan_out(
                        &scvmm_cluster_store,
                        scvmm_cluster.namespace().as_deref(),
                        scvmm_cluster_name(&scvmm_cluster),
                    )
                },
            )
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((object, _)) => debug!("Reconciled ScvmmMachine {}", object.name),
                    Err(e) => error!("Controller error for ScvmmMachine: {}", e),
                }
            })
            .await;

        Ok(())
    }
}

fn fan_out(
    store: &Store<ScvmmMachine>,
    namespace: Option<&str>,
    cluster_name: Option<String>,
) -> Vec<ObjectRef<ScvmmMachine>> {
    match cluster_name {
        Some(cluster_name) => machines_in_cluster(&store.state(), namespace, &cluster_name),
        None => Vec::new(),
    }
}
