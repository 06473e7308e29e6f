//! Test utilities for unit testing the reconciler
//!
//! Builders for the resources the controller reads plus an in-memory
//! [`ResourceStore`] that records every machine patch.

#[cfg(test)]
use crate::config::{ControllerConfig, ProviderDefaults};
#[cfg(test)]
use crate::error::ControllerError;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use crate::store::ResourceStore;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use k8s_openapi::api::core::v1::Secret;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
#[cfg(test)]
use k8s_openapi::ByteString;
#[cfg(test)]
use scvmm_client::{FunctionLibrary, MockConnector, MockScvmmClient};
#[cfg(test)]
use std::collections::{BTreeMap, HashMap};
#[cfg(test)]
use std::sync::{Arc, Mutex};

#[cfg(test)]
pub const TEST_NAMESPACE: &str = "default";
#[cfg(test)]
pub const TEST_CLUSTER: &str = "capi-test";

#[cfg(test)]
fn metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("uid-{}", name)),
        ..Default::default()
    }
}

/// Helper to create a standalone ScvmmMachine with inline cloud-init
#[cfg(test)]
pub fn create_test_scvmm_machine(name: &str) -> ScvmmMachine {
    let mut machine = ScvmmMachine::new(
        name,
        ScvmmMachineSpec {
            cloud: "Cloud1".to_string(),
            host_group: "All Hosts".to_string(),
            vm_template: "ubuntu-2404".to_string(),
            vm_network: "Prod".to_string(),
            memory: Some("4Gi".to_string()),
            cpu_count: 2,
            disks: vec![VmDisk {
                size: Some("10Gi".to_string()),
                vh_disk: String::new(),
                dynamic: true,
            }],
            cloud_init: Some(CloudInitSpec::default()),
            ..Default::default()
        },
    );
    machine.metadata = metadata(name, TEST_NAMESPACE);
    machine
}

/// Standalone machine that already carries the finalizer
#[cfg(test)]
pub fn create_test_finalized_machine(name: &str) -> ScvmmMachine {
    let mut machine = create_test_scvmm_machine(name);
    machine.add_finalizer();
    machine
}

/// ScvmmMachine owned by a Cluster API Machine in [`TEST_CLUSTER`]
#[cfg(test)]
pub fn create_test_owned_machine(name: &str, owner: &str) -> ScvmmMachine {
    let mut machine = create_test_scvmm_machine(name);
    machine.spec.cloud_init = None;
    machine.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        TEST_CLUSTER.to_string(),
    )]));
    machine.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "cluster.x-k8s.io/v1beta1".to_string(),
        kind: "Machine".to_string(),
        name: owner.to_string(),
        uid: format!("uid-{}", owner),
        ..Default::default()
    }]);
    machine
}

/// Mark the machine as being deleted
#[cfg(test)]
pub fn mark_deleting(machine: &mut ScvmmMachine) {
    machine.metadata.deletion_timestamp =
        Some(serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).unwrap());
}

#[cfg(test)]
pub fn create_test_capi_machine(name: &str, data_secret_name: Option<&str>) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: TEST_CLUSTER.to_string(),
            bootstrap: Bootstrap {
                data_secret_name: data_secret_name.map(str::to_string),
            },
            infrastructure_ref: InfrastructureReference {
                api_version: Some("infrastructure.cluster.x-k8s.io/v1beta1".to_string()),
                kind: Some("ScvmmMachine".to_string()),
                name: format!("{}-infra", name),
                namespace: Some(TEST_NAMESPACE.to_string()),
            },
        },
    );
    machine.metadata = metadata(name, TEST_NAMESPACE);
    machine.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAME_LABEL.to_string(),
        TEST_CLUSTER.to_string(),
    )]));
    machine
}

#[cfg(test)]
pub fn create_test_cluster(infrastructure_ready: bool, control_plane_initialized: bool) -> Cluster {
    let mut cluster = Cluster::new(
        TEST_CLUSTER,
        ClusterSpec {
            infrastructure_ref: Some(InfrastructureReference {
                api_version: Some("infrastructure.cluster.x-k8s.io/v1beta1".to_string()),
                kind: Some("ScvmmCluster".to_string()),
                name: TEST_CLUSTER.to_string(),
                namespace: Some(TEST_NAMESPACE.to_string()),
            }),
            paused: false,
        },
    );
    cluster.metadata = metadata(TEST_CLUSTER, TEST_NAMESPACE);
    let mut conditions = Vec::new();
    if control_plane_initialized {
        crate::conditions::mark_true(&mut conditions, CONTROL_PLANE_INITIALIZED_CONDITION);
    }
    cluster.status = Some(ClusterStatus {
        infrastructure_ready,
        control_plane_ready: control_plane_initialized,
        conditions,
    });
    cluster
}

#[cfg(test)]
pub fn create_test_scvmm_cluster(provider: Option<&str>) -> ScvmmCluster {
    let mut cluster = ScvmmCluster::new(
        TEST_CLUSTER,
        ScvmmClusterSpec {
            provider_ref: provider.map(ProviderReference::new),
            control_plane_endpoint: None,
        },
    );
    cluster.metadata = metadata(TEST_CLUSTER, TEST_NAMESPACE);
    cluster
}

#[cfg(test)]
pub fn create_test_provider(name: &str, namespace: &str, scvmm_host: &str) -> ScvmmProvider {
    let mut provider = ScvmmProvider::new(
        name,
        ScvmmProviderSpec {
            scvmm_host: scvmm_host.to_string(),
            ..Default::default()
        },
    );
    provider.metadata = metadata(name, namespace);
    provider
}

#[cfg(test)]
pub fn create_test_secret(name: &str, namespace: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: metadata(name, namespace),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// In-memory ResourceStore
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MockResourceStore {
    machines: Arc<Mutex<HashMap<String, Machine>>>,
    clusters: Arc<Mutex<HashMap<String, Cluster>>>,
    scvmm_clusters: Arc<Mutex<HashMap<String, ScvmmCluster>>>,
    providers: Arc<Mutex<HashMap<String, ScvmmProvider>>>,
    secrets: Arc<Mutex<HashMap<String, Secret>>>,
    patches: Arc<Mutex<Vec<ScvmmMachine>>>,
}

#[cfg(test)]
fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[cfg(test)]
fn key_of(metadata: &ObjectMeta) -> String {
    key(
        metadata.namespace.as_deref().unwrap_or(TEST_NAMESPACE),
        metadata.name.as_deref().unwrap_or_default(),
    )
}

#[cfg(test)]
impl MockResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_machine(&self, machine: Machine) {
        self.machines.lock().unwrap().insert(key_of(&machine.metadata), machine);
    }

    pub fn insert_cluster(&self, cluster: Cluster) {
        self.clusters.lock().unwrap().insert(key_of(&cluster.metadata), cluster);
    }

    pub fn insert_scvmm_cluster(&self, cluster: ScvmmCluster) {
        self.scvmm_clusters.lock().unwrap().insert(key_of(&cluster.metadata), cluster);
    }

    pub fn insert_provider(&self, provider: ScvmmProvider) {
        self.providers.lock().unwrap().insert(key_of(&provider.metadata), provider);
    }

    pub fn insert_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().insert(key_of(&secret.metadata), secret);
    }

    /// Every machine patched so far, in order
    pub fn patches(&self) -> Vec<ScvmmMachine> {
        self.patches.lock().unwrap().clone()
    }

    pub fn last_patch(&self) -> Option<ScvmmMachine> {
        self.patches.lock().unwrap().last().cloned()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ResourceStore for MockResourceStore {
    async fn machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, ControllerError> {
        Ok(self.machines.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, ControllerError> {
        Ok(self.clusters.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn scvmm_cluster(&self, namespace: &str, name: &str) -> Result<Option<ScvmmCluster>, ControllerError> {
        Ok(self.scvmm_clusters.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn provider(&self, namespace: &str, name: &str) -> Result<Option<ScvmmProvider>, ControllerError> {
        Ok(self.providers.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, ControllerError> {
        Ok(self.secrets.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn patch_machine(&self, machine: &ScvmmMachine) -> Result<(), ControllerError> {
        self.patches.lock().unwrap().push(machine.clone());
        Ok(())
    }
}

/// Controller configuration pointing at a fake management server
#[cfg(test)]
pub fn create_test_config() -> ControllerConfig {
    ControllerConfig {
        defaults: ProviderDefaults {
            scvmm_host: "vmm01".to_string(),
            username: "svc-capi".to_string(),
            password: "secret".to_string(),
            ad_server: "dc01".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Reconciler wired to in-memory mocks, with handles to inspect them
#[cfg(test)]
pub struct TestHarness {
    pub reconciler: Reconciler,
    pub store: MockResourceStore,
    pub scvmm: MockScvmmClient,
    pub connector: MockConnector,
}

#[cfg(test)]
pub fn create_test_harness() -> TestHarness {
    create_test_harness_with_config(create_test_config())
}

#[cfg(test)]
pub fn create_test_harness_with_config(config: ControllerConfig) -> TestHarness {
    let store = MockResourceStore::new();
    let scvmm = MockScvmmClient::new();
    let connector = MockConnector::new(scvmm.clone());
    let reconciler = Reconciler::new(
        store.clone(),
        connector.clone(),
        config,
        FunctionLibrary::default(),
    );
    TestHarness {
        reconciler,
        store,
        scvmm,
        connector,
    }
}

/// Replace `machine` with the last persisted version, as the next watch event would
#[cfg(test)]
pub fn persisted(store: &MockResourceStore, machine: &ScvmmMachine) -> ScvmmMachine {
    store.last_patch().unwrap_or_else(|| machine.clone())
}
