//! Reconciliation of ScvmmMachine resources.
//!
//! The state of a machine is never stored; every attempt re-derives it from
//! the desired spec, the persisted status and a fresh lookup on SCVMM:
//!
//! - `machine`: owner chain, finalizer, creation, power-on and readiness
//! - `delete`: VM and AD computer removal before the finalizer is released
//!
//! Every status change goes through [`Reconciler::patch_machine`], which also
//! recomputes the `Ready` summary.

pub mod delete;
pub mod machine;

mod machine_test;

use crate::backoff::FibonacciBackoff;
use crate::conditions::{
    mark_false, set_summary, CLUSTER_NOT_AVAILABLE, MISSING_CLUSTER, VM_FAILED,
    WAITING_FOR_CLUSTER_INFRASTRUCTURE, WAITING_FOR_OWNER,
};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::provider::{resolve_provider, ProviderConfig};
use crate::store::ResourceStore;
use crds::{
    Cluster, ConditionSeverity, Machine, ProviderReference, ScvmmCluster, ScvmmMachine,
    CLUSTER_API_GROUP, VM_CREATED_CONDITION, VM_RUNNING_CONDITION,
};
use kube_runtime::controller::Action;
use scvmm_client::{FunctionLibrary, ScvmmClientTrait, ScvmmConnector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Conditions summarised into `Ready`, in tie-break order
pub const MACHINE_CONDITIONS: [&str; 2] = [VM_CREATED_CONDITION, VM_RUNNING_CONDITION];

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(10, 300), // 10 seconds min, 5 minutes max
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Outcome of a successful attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Nothing to do until the object or a dependency changes
    None,
    After(Duration),
}

impl Requeue {
    /// After a mutating call
    pub const SHORT: Requeue = Requeue::After(Duration::from_secs(10));
    /// Waiting for power-on or removal
    pub const POLL: Requeue = Requeue::After(Duration::from_secs(30));
    /// Address discovery and remote error retry
    pub const LONG: Requeue = Requeue::After(Duration::from_secs(60));

    pub fn into_action(self) -> Action {
        match self {
            Requeue::None => Action::await_change(),
            Requeue::After(delay) => Action::requeue(delay),
        }
    }
}

/// Cluster API objects a machine depends on
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    pub owner: Option<Machine>,
    pub cluster: Option<Cluster>,
    pub scvmm_cluster: Option<ScvmmCluster>,
}

enum Resolution {
    Ready(Dependencies),
    Blocked { reason: &'static str, message: String },
}

/// `namespace/name` of a machine
pub fn object_key(machine: &ScvmmMachine) -> String {
    format!(
        "{}/{}",
        machine.metadata.namespace.as_deref().unwrap_or("default"),
        machine.metadata.name.as_deref().unwrap_or_default()
    )
}

fn namespace_of(machine: &ScvmmMachine) -> String {
    machine
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

/// Name of the owning Cluster API Machine
fn owner_machine_name(machine: &ScvmmMachine) -> Option<String> {
    machine
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| {
            owner.kind == "Machine"
                && owner.api_version.split('/').next() == Some(CLUSTER_API_GROUP)
        })
        .map(|owner| owner.name.clone())
}

/// Reconciles ScvmmMachine resources.
pub struct Reconciler {
    pub(crate) store: Box<dyn ResourceStore>,
    pub(crate) connector: Box<dyn ScvmmConnector>,
    pub(crate) config: ControllerConfig,
    pub(crate) library: Arc<FunctionLibrary>,
    /// Error count tracking per resource (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        store: impl ResourceStore + 'static,
        connector: impl ScvmmConnector + 'static,
        config: ControllerConfig,
        library: FunctionLibrary,
    ) -> Self {
        Self {
            store: Box::new(store),
            connector: Box::new(connector),
            config,
            library: Arc::new(library),
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one attempt for a machine
    pub async fn reconcile_machine(&self, scvmm_machine: &ScvmmMachine) -> Result<Requeue, ControllerError> {
        let mut machine = scvmm_machine.clone();
        let key = object_key(&machine);
        info!("Reconciling ScvmmMachine {}", key);

        if machine.is_deleting() {
            return self.reconcile_delete(&mut machine).await;
        }

        let dependencies = if machine.spec.cloud_init.is_none() {
            match self.resolve_dependencies(&machine).await? {
                Resolution::Ready(dependencies) => dependencies,
                Resolution::Blocked { reason, message } => {
                    info!("ScvmmMachine {} is waiting: {} {}", key, reason, message);
                    return self
                        .patch_reason_condition(
                            &mut machine,
                            VM_CREATED_CONDITION,
                            reason,
                            ConditionSeverity::Info,
                            &message,
                            Requeue::None,
                        )
                        .await;
                }
            }
        } else {
            Dependencies::default()
        };

        if machine.add_finalizer() {
            info!("Adding finalizer to ScvmmMachine {}", key);
            self.patch_machine(&mut machine).await?;
            return Ok(Requeue::None);
        }

        let provider = self.provider_for(&machine, &dependencies).await?;
        self.reconcile_normal(&mut machine, &dependencies, &provider).await
    }

    /// Owner Machine, Cluster and ScvmmCluster, all of which must be ready
    async fn resolve_dependencies(&self, machine: &ScvmmMachine) -> Result<Resolution, ControllerError> {
        let namespace = namespace_of(machine);

        let Some(owner_name) = owner_machine_name(machine) else {
            return Ok(Resolution::Blocked {
                reason: WAITING_FOR_OWNER,
                message: String::new(),
            });
        };
        let Some(owner) = self.store.machine(&namespace, &owner_name).await? else {
            return Ok(Resolution::Blocked {
                reason: WAITING_FOR_OWNER,
                message: format!("Machine {} not found", owner_name),
            });
        };

        let Some(cluster_name) = owner.cluster_name().map(str::to_string) else {
            return Ok(Resolution::Blocked {
                reason: MISSING_CLUSTER,
                message: "Please associate this machine with a cluster using the label cluster.x-k8s.io/cluster-name: <name of cluster>".to_string(),
            });
        };
        let Some(cluster) = self.store.cluster(&namespace, &cluster_name).await? else {
            return Ok(Resolution::Blocked {
                reason: MISSING_CLUSTER,
                message: format!("Cluster {} does not exist", cluster_name),
            });
        };

        let Some(infrastructure) = cluster
            .spec
            .infrastructure_ref
            .as_ref()
            .filter(|r| !r.name.is_empty())
        else {
            return Ok(Resolution::Blocked {
                reason: CLUSTER_NOT_AVAILABLE,
                message: format!("Cluster {} has no infrastructure reference", cluster_name),
            });
        };
        let infrastructure_namespace = infrastructure.namespace.as_deref().unwrap_or(&namespace);
        let Some(scvmm_cluster) = self
            .store
            .scvmm_cluster(infrastructure_namespace, &infrastructure.name)
            .await?
        else {
            return Ok(Resolution::Blocked {
                reason: CLUSTER_NOT_AVAILABLE,
                message: format!("ScvmmCluster {} not found", infrastructure.name),
            });
        };

        if !cluster.infrastructure_ready() {
            return Ok(Resolution::Blocked {
                reason: WAITING_FOR_CLUSTER_INFRASTRUCTURE,
                message: String::new(),
            });
        }

        Ok(Resolution::Ready(Dependencies {
            owner: Some(owner),
            cluster: Some(cluster),
            scvmm_cluster: Some(scvmm_cluster),
        }))
    }

    /// Best-effort dependency lookup for deletion, which must not block on them
    pub(crate) async fn lookup_dependencies(&self, machine: &ScvmmMachine) -> Dependencies {
        if machine.spec.cloud_init.is_some() {
            return Dependencies::default();
        }
        match self.resolve_dependencies(machine).await {
            Ok(Resolution::Ready(dependencies)) => dependencies,
            Ok(Resolution::Blocked { reason, .. }) => {
                debug!("ScvmmMachine {} dependencies unavailable: {}", object_key(machine), reason);
                Dependencies::default()
            }
            Err(e) => {
                warn!("Failed to look up dependencies of ScvmmMachine {}: {}", object_key(machine), e);
                Dependencies::default()
            }
        }
    }

    /// Provider from the ScvmmCluster, else from the machine itself
    pub(crate) async fn provider_for(
        &self,
        machine: &ScvmmMachine,
        dependencies: &Dependencies,
    ) -> Result<ProviderConfig, ControllerError> {
        let reference: Option<ProviderReference> = dependencies
            .scvmm_cluster
            .as_ref()
            .and_then(|c| c.spec.provider_ref.clone())
            .or_else(|| machine.spec.provider_ref.clone());
        let namespace = dependencies
            .scvmm_cluster
            .as_ref()
            .and_then(|c| c.metadata.namespace.clone())
            .unwrap_or_else(|| namespace_of(machine));

        resolve_provider(
            self.store.as_ref(),
            &self.config.defaults,
            &self.library,
            reference.as_ref(),
            &namespace,
        )
        .await
    }

    /// Open a session for the rest of the attempt
    pub(crate) async fn connect(
        &self,
        machine: &ScvmmMachine,
        provider: &ProviderConfig,
    ) -> Result<Box<dyn ScvmmClientTrait>, ControllerError> {
        debug!("Opening SCVMM session for ScvmmMachine {} on {}", object_key(machine), provider.exec_host);
        self.connector
            .connect(&provider.session_config(&self.config))
            .await
            .map_err(|e| {
                error!("Failed to open SCVMM session for ScvmmMachine {}: {}", object_key(machine), e);
                ControllerError::from(e)
            })
    }

    /// Recompute the summary and persist the machine
    pub(crate) async fn patch_machine(&self, machine: &mut ScvmmMachine) -> Result<(), ControllerError> {
        let step_counter = !machine.is_deleting();
        set_summary(&mut machine.status_mut().conditions, &MACHINE_CONDITIONS, step_counter);
        self.store.patch_machine(machine).await
    }

    /// Mark `condition` false with `reason`, persist, and requeue as asked
    pub(crate) async fn patch_reason_condition(
        &self,
        machine: &mut ScvmmMachine,
        condition: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: &str,
        requeue: Requeue,
    ) -> Result<Requeue, ControllerError> {
        let status = machine.status_mut();
        status.ready = false;
        mark_false(&mut status.conditions, condition, reason, severity, message);
        self.patch_machine(machine).await?;
        Ok(requeue)
    }

    /// Record an attempt error on `condition` and hand the error back
    pub(crate) async fn record_error(
        &self,
        machine: &mut ScvmmMachine,
        condition: &str,
        reason: &str,
        context: &str,
        err: impl Into<ControllerError>,
    ) -> ControllerError {
        let err = err.into();
        let message = format!("{}: {}", context, err);
        error!("ScvmmMachine {}: {}", object_key(machine), message);

        let status = machine.status_mut();
        status.ready = false;
        mark_false(&mut status.conditions, condition, reason, ConditionSeverity::Error, &message);
        if let Err(patch_err) = self.patch_machine(machine).await {
            error!("Failed to patch ScvmmMachine {}: {}", object_key(machine), patch_err);
        }
        err
    }

    /// Record a failure reported by a remote function and retry later
    pub(crate) async fn remote_failure(
        &self,
        machine: &mut ScvmmMachine,
        condition: &str,
        context: &str,
        failure: &str,
    ) -> Result<Requeue, ControllerError> {
        let message = format!("{}: {}", context, failure);
        warn!("ScvmmMachine {}: {}", object_key(machine), message);
        self.patch_reason_condition(
            machine,
            condition,
            VM_FAILED,
            ConditionSeverity::Error,
            &message,
            Requeue::LONG,
        )
        .await
    }

    /// Requeue action for a failed attempt
    ///
    /// Configuration errors wait for the object to change; everything else
    /// backs off per object.
    pub fn error_action(&self, machine: &ScvmmMachine, error: &ControllerError) -> Action {
        let key = object_key(machine);
        if !error.is_retryable() {
            error!("ScvmmMachine {} cannot be reconciled until it changes: {}", key, error);
            return Action::await_change();
        }

        let (backoff_seconds, error_count) = match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states.entry(key.clone()).or_insert_with(BackoffState::new);
                state.increment_error();
                (state.backoff.next_backoff_seconds(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (60, 0)
            }
        };
        warn!(
            "Reconciliation of ScvmmMachine {} failed ({} consecutive), retrying in {}s: {}",
            key, error_count, backoff_seconds, error
        );
        Action::requeue(Duration::from_secs(backoff_seconds))
    }

    /// Reset error count for a machine (on successful reconciliation)
    pub fn reset_error(&self, machine: &ScvmmMachine) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(&object_key(machine)) {
                state.reset();
            }
        }
    }
}
