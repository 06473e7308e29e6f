//! Unit tests for the machine reconcile flow

#[cfg(test)]
mod tests {
    use crate::conditions::*;
    use crate::error::ControllerError;
    use crate::reconciler::Requeue;
    use crate::test_utils::*;
    use crds::*;
    use kube_runtime::controller::Action;
    use scvmm_client::{VirtualDiskInfo, VmResult};
    use std::time::Duration;

    const GIB: i64 = 1024 * MEBIBYTE;

    fn condition<'a>(machine: &'a ScvmmMachine, type_: &str) -> &'a Condition {
        let status = machine.status.as_ref().expect("status missing");
        find_condition(&status.conditions, type_).unwrap_or_else(|| panic!("{} condition missing", type_))
    }

    fn remote_vm(name: &str, status: &str, disk_bytes: i64) -> VmResult {
        VmResult {
            name: name.to_string(),
            status: status.to_string(),
            vm_id: format!("vmid-{}", name),
            bios_guid: format!("bios-{}", name),
            virtual_disks: vec![VirtualDiskInfo {
                size: 4 * MEBIBYTE,
                maximum_size: disk_bytes,
            }],
            ..Default::default()
        }
    }

    fn named_machine(name: &str) -> ScvmmMachine {
        let mut machine = create_test_finalized_machine(name);
        machine.spec.vm_name = name.to_string();
        machine
    }

    #[tokio::test]
    async fn test_finalizer_added_before_any_remote_call() {
        let harness = create_test_harness();
        let machine = create_test_scvmm_machine("web-01");

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::None);
        assert!(harness.connector.connects().is_empty());
        let patched = harness.store.last_patch().unwrap();
        assert!(patched.has_finalizer());
    }

    #[tokio::test]
    async fn test_fresh_machine_generates_name_and_creates_vm() {
        let harness = create_test_harness();
        let machine = create_test_finalized_machine("web-01");

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
        assert_eq!(harness.scvmm.calls(), vec!["GenerateVMName", "CreateVM"]);

        let patched = harness.store.last_patch().unwrap();
        assert_eq!(patched.spec.vm_name, "vm-001");
        assert_eq!(patched.spec.provider_id.as_deref(), Some("scvmm://vmid-vm-001"));
        let status = patched.status.as_ref().unwrap();
        assert!(!status.ready);
        assert_eq!(status.vm_status, "UnderCreation");
        assert_eq!(status.vm_id, "vmid-vm-001");
        let created = condition(&patched, VM_CREATED_CONDITION);
        assert_eq!(created.status, ConditionStatus::False);
        assert_eq!(created.reason.as_deref(), Some(VM_CREATING));

        let created_vm = harness.scvmm.vm("vm-001").unwrap();
        assert_eq!(created_vm.memory, 4096);
        assert_eq!(created_vm.cpu_count, 2);
        assert_eq!(harness.scvmm.close_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_vm_is_never_created_again() {
        let harness = create_test_harness();
        let machine = create_test_finalized_machine("web-01");

        harness.reconciler.reconcile_machine(&machine).await.unwrap();
        let machine = persisted(&harness.store, &machine);
        harness.scvmm.clear_calls();

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
        assert_eq!(harness.scvmm.calls(), vec!["GetVM", "AddVMSpec", "StartVM"]);
        assert_eq!(harness.scvmm.call_count("CreateVM"), 0);
        let patched = harness.store.last_patch().unwrap();
        assert!(is_condition_true(&patched.status.as_ref().unwrap().conditions, VM_CREATED_CONDITION));
        assert_eq!(patched.status.as_ref().unwrap().vm_status, "Running");
    }

    #[tokio::test]
    async fn test_disk_growth_is_expanded_before_boot() {
        let harness = create_test_harness();
        let mut machine = named_machine("web-01");
        machine.spec.disks[0].size = Some("20Gi".to_string());
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
        assert_eq!(harness.scvmm.mutating_calls(), vec!["ExpandVMDisks"]);
        assert_eq!(harness.scvmm.vm("web-01").unwrap().virtual_disks[0].maximum_size, 20 * GIB);
        let patched = harness.store.last_patch().unwrap();
        assert!(!patched.status.as_ref().unwrap().ready);
        assert_eq!(condition(&patched, VM_CREATED_CONDITION).reason.as_deref(), Some(VM_UPDATING));
    }

    #[tokio::test]
    async fn test_disk_within_rounding_is_not_expanded() {
        let harness = create_test_harness();
        let mut machine = named_machine("web-01");
        machine.spec.disks[0].size = Some("10241Mi".to_string());
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));

        harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(harness.scvmm.call_count("ExpandVMDisks"), 0);
        assert_eq!(harness.scvmm.mutating_calls(), vec!["StartVM"]);
    }

    #[tokio::test]
    async fn test_remote_spec_amendments_are_persisted() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));
        harness.scvmm.set_spec_echo(serde_json::json!({ "vmNetwork": "Amended", "cpuCount": 0 }));

        harness.reconciler.reconcile_machine(&machine).await.unwrap();

        let first = &harness.store.patches()[0];
        assert_eq!(first.spec.vm_network, "Amended");
        assert_eq!(first.spec.cpu_count, 2);
    }

    #[tokio::test]
    async fn test_cloud_init_media_is_attached_instead_of_plain_start() {
        let harness = create_test_harness();
        let mut machine = named_machine("web-01");
        machine.spec.cloud_init = Some(CloudInitSpec {
            user_data: "#cloud-config\n".to_string(),
            ..Default::default()
        });
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
        assert_eq!(harness.scvmm.mutating_calls(), vec!["WriteCloudInitIso", "AddIsoToVM"]);
        let media = harness.scvmm.written_media();
        assert_eq!(media[0].0, r"\\vmm01\MSSCVMMLibrary\ISOs\cloud-init\web-01-cloud-init.iso");
        assert_eq!(media[0].1.user_data, "#cloud-config\n");
        assert_eq!(media[0].1.meta_data, "instance-id: vmid-web-01\nlocal-hostname: web-01\n");

        let starting = harness
            .store
            .patches()
            .into_iter()
            .find(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| find_condition(&s.conditions, VM_RUNNING_CONDITION))
                    .is_some()
            })
            .expect("VmRunning never recorded");
        assert_eq!(condition(&starting, VM_RUNNING_CONDITION).reason.as_deref(), Some(VM_STARTING));
    }

    #[tokio::test]
    async fn test_vm_between_power_off_and_running_is_polled() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        harness.scvmm.insert_vm(remote_vm("web-01", "UnderCreation", 10 * GIB));

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(30)));
        assert!(harness.scvmm.mutating_calls().is_empty());
        let patched = harness.store.last_patch().unwrap();
        assert_eq!(condition(&patched, VM_RUNNING_CONDITION).reason.as_deref(), Some(VM_STARTING));
        assert!(is_condition_true(&patched.status.as_ref().unwrap().conditions, VM_CREATED_CONDITION));
    }

    #[tokio::test]
    async fn test_running_vm_without_hostname_is_read_again() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        let mut vm = remote_vm("web-01", "Running", 10 * GIB);
        vm.ipv4_addresses = vec!["10.0.0.5".to_string()];
        harness.scvmm.insert_vm(vm);

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(60)));
        assert_eq!(harness.scvmm.calls(), vec!["GetVM", "ReadVM"]);
        let patched = harness.store.last_patch().unwrap();
        let status = patched.status.as_ref().unwrap();
        assert!(status.ready);
        assert_eq!(status.addresses[0].address, "10.0.0.5");
        assert_eq!(status.addresses[0].type_, MachineAddressType::InternalIP);
        assert!(is_condition_true(&status.conditions, VM_RUNNING_CONDITION));
        assert!(is_condition_true(&status.conditions, READY_CONDITION));
    }

    #[tokio::test]
    async fn test_running_vm_is_idempotent() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        let mut vm = remote_vm("web-01", "Running", 10 * GIB);
        vm.ipv4_addresses = vec!["10.0.0.5".to_string()];
        vm.hostname = "web-01.corp.local".to_string();
        harness.scvmm.insert_vm(vm);

        let first = harness.reconciler.reconcile_machine(&machine).await.unwrap();
        let machine = persisted(&harness.store, &machine);
        let second = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(first, Requeue::None);
        assert_eq!(second, first);
        assert_eq!(harness.scvmm.calls(), vec!["GetVM", "GetVM"]);
        assert_eq!(harness.store.last_patch().unwrap().status.unwrap().hostname, "web-01.corp.local");
    }

    #[tokio::test]
    async fn test_full_lifecycle_reaches_running() {
        let harness = create_test_harness();
        let mut machine = create_test_scvmm_machine("web-01");
        let mut outcomes = Vec::new();

        for _ in 0..4 {
            outcomes.push(harness.reconciler.reconcile_machine(&machine).await.unwrap());
            machine = persisted(&harness.store, &machine);
        }

        assert_eq!(
            outcomes,
            vec![
                Requeue::None,
                Requeue::After(Duration::from_secs(10)),
                Requeue::After(Duration::from_secs(10)),
                Requeue::After(Duration::from_secs(60)),
            ]
        );
        assert_eq!(
            harness.scvmm.mutating_calls(),
            vec!["CreateVM", "StartVM"]
        );
        assert_eq!(harness.scvmm.close_count() as usize, harness.connector.connects().len());
    }

    #[tokio::test]
    async fn test_structured_error_is_recorded_and_retried() {
        let harness = create_test_harness();
        let machine = create_test_finalized_machine("web-01");
        harness.scvmm.fail_with("CreateVM", "no host has enough capacity");

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(60)));
        let patched = harness.store.last_patch().unwrap();
        let created = condition(&patched, VM_CREATED_CONDITION);
        assert_eq!(created.reason.as_deref(), Some(VM_FAILED));
        assert_eq!(created.severity, Some(ConditionSeverity::Error));
        assert!(created.message.as_deref().unwrap().contains("no host has enough capacity"));
        // The generated name survives so the next attempt can find a half-created VM
        assert_eq!(patched.spec.vm_name, "vm-001");
        assert_eq!(condition(&patched, READY_CONDITION).severity, Some(ConditionSeverity::Error));
    }

    #[tokio::test]
    async fn test_transport_error_fails_attempt_and_backs_off() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));
        harness.scvmm.fail_transport("StartVM");

        let err = harness.reconciler.reconcile_machine(&machine).await.unwrap_err();

        assert!(matches!(err, ControllerError::Scvmm(_)));
        assert_eq!(harness.scvmm.close_count(), 1);
        let patched = harness.store.last_patch().unwrap();
        assert_eq!(condition(&patched, VM_RUNNING_CONDITION).severity, Some(ConditionSeverity::Error));

        let delays: Vec<Action> = (0..4)
            .map(|_| harness.reconciler.error_action(&machine, &err))
            .collect();
        assert_eq!(
            delays,
            vec![
                Action::requeue(Duration::from_secs(10)),
                Action::requeue(Duration::from_secs(10)),
                Action::requeue(Duration::from_secs(20)),
                Action::requeue(Duration::from_secs(30)),
            ]
        );

        harness.reconciler.reset_error(&machine);
        assert_eq!(
            harness.reconciler.error_action(&machine, &err),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn test_session_failure_makes_no_remote_calls() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        harness.connector.fail_connect("connection refused");

        let err = harness.reconciler.reconcile_machine(&machine).await.unwrap_err();

        assert!(matches!(err, ControllerError::Scvmm(_)));
        assert!(harness.scvmm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_management_host_is_not_retried() {
        let harness = create_test_harness_with_config(crate::config::ControllerConfig::default());
        let machine = named_machine("web-01");

        let err = harness.reconciler.reconcile_machine(&machine).await.unwrap_err();

        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(harness.connector.connects().is_empty());
        assert_eq!(harness.reconciler.error_action(&machine, &err), Action::await_change());
    }

    #[tokio::test]
    async fn test_ad_computer_is_registered_before_creation() {
        let harness = create_test_harness();
        let mut machine = create_test_finalized_machine("web-01");
        machine.spec.vm_name = "web-01".to_string();
        machine.spec.active_directory = Some(ActiveDirectorySpec {
            ou_path: "OU=Servers,DC=corp,DC=local".to_string(),
            ..Default::default()
        });

        harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(harness.scvmm.calls(), vec!["GetVM", "CreateADComputer", "CreateVM"]);
        assert!(harness.scvmm.has_ad_computer("web-01"));
    }

    #[tokio::test]
    async fn test_owned_machine_waits_for_owner() {
        let harness = create_test_harness();
        let machine = create_test_owned_machine("web-01", "m1");

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::None);
        assert!(harness.connector.connects().is_empty());
        let patched = harness.store.last_patch().unwrap();
        let created = condition(&patched, VM_CREATED_CONDITION);
        assert_eq!(created.reason.as_deref(), Some(WAITING_FOR_OWNER));
        assert_eq!(created.severity, Some(ConditionSeverity::Info));
        assert!(!patched.has_finalizer());
    }

    #[tokio::test]
    async fn test_owned_machine_waits_for_cluster_chain() {
        let harness = create_test_harness();
        let machine = create_test_owned_machine("web-01", "m1");
        harness.store.insert_machine(create_test_capi_machine("m1", None));

        harness.reconciler.reconcile_machine(&machine).await.unwrap();
        let reason = |h: &TestHarness| {
            condition(&h.store.last_patch().unwrap(), VM_CREATED_CONDITION)
                .reason
                .clone()
        };
        assert_eq!(reason(&harness).as_deref(), Some(MISSING_CLUSTER));

        harness.store.insert_cluster(create_test_cluster(false, false));
        harness.reconciler.reconcile_machine(&machine).await.unwrap();
        assert_eq!(reason(&harness).as_deref(), Some(CLUSTER_NOT_AVAILABLE));

        harness.store.insert_scvmm_cluster(create_test_scvmm_cluster(None));
        harness.reconciler.reconcile_machine(&machine).await.unwrap();
        assert_eq!(reason(&harness).as_deref(), Some(WAITING_FOR_CLUSTER_INFRASTRUCTURE));

        assert!(harness.connector.connects().is_empty());
    }

    fn ready_owned_machine(harness: &TestHarness, data_secret: Option<&str>, control_plane: bool) -> ScvmmMachine {
        harness.store.insert_machine(create_test_capi_machine("m1", data_secret));
        harness.store.insert_cluster(create_test_cluster(true, control_plane));
        harness.store.insert_scvmm_cluster(create_test_scvmm_cluster(None));
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));
        let mut machine = create_test_owned_machine("web-01", "m1");
        machine.add_finalizer();
        machine.spec.vm_name = "web-01".to_string();
        machine
    }

    #[tokio::test]
    async fn test_worker_waits_for_control_plane() {
        let harness = create_test_harness();
        let machine = ready_owned_machine(&harness, None, false);

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::None);
        assert!(harness.scvmm.mutating_calls().is_empty());
        let patched = harness.store.last_patch().unwrap();
        assert_eq!(
            condition(&patched, VM_CREATED_CONDITION).reason.as_deref(),
            Some(WAITING_FOR_CONTROLPLANE_AVAILABLE)
        );
    }

    #[tokio::test]
    async fn test_worker_waits_for_bootstrap_data_once_control_plane_is_up() {
        let harness = create_test_harness();
        let machine = ready_owned_machine(&harness, None, true);

        harness.reconciler.reconcile_machine(&machine).await.unwrap();

        let patched = harness.store.last_patch().unwrap();
        assert_eq!(
            condition(&patched, VM_CREATED_CONDITION).reason.as_deref(),
            Some(WAITING_FOR_BOOTSTRAP_DATA)
        );
    }

    #[tokio::test]
    async fn test_bootstrap_secret_is_written_as_user_data() {
        let harness = create_test_harness();
        let machine = ready_owned_machine(&harness, Some("m1-bootstrap"), true);
        harness.store.insert_secret(create_test_secret(
            "m1-bootstrap",
            TEST_NAMESPACE,
            &[("value", "#cloud-config\nruncmd: [kubeadm join]\n")],
        ));

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
        assert_eq!(harness.scvmm.mutating_calls(), vec!["WriteCloudInitIso", "AddIsoToVM"]);
        assert_eq!(
            harness.scvmm.written_media()[0].1.user_data,
            "#cloud-config\nruncmd: [kubeadm join]\n"
        );
    }

    #[tokio::test]
    async fn test_missing_bootstrap_secret_fails_attempt() {
        let harness = create_test_harness();
        let machine = ready_owned_machine(&harness, Some("m1-bootstrap"), true);

        let err = harness.reconciler.reconcile_machine(&machine).await.unwrap_err();

        assert!(matches!(err, ControllerError::Bootstrap(_)));
        assert!(harness.scvmm.mutating_calls().is_empty());
        let patched = harness.store.last_patch().unwrap();
        let created = condition(&patched, VM_CREATED_CONDITION);
        assert_eq!(created.reason.as_deref(), Some(WAITING_FOR_BOOTSTRAP_DATA));
        assert_eq!(created.severity, Some(ConditionSeverity::Error));
    }

    #[tokio::test]
    async fn test_provider_comes_from_scvmm_cluster() {
        let harness = create_test_harness();
        let machine = ready_owned_machine(&harness, None, false);
        harness.store.insert_scvmm_cluster(create_test_scvmm_cluster(Some("prod")));
        harness
            .store
            .insert_provider(create_test_provider("prod", TEST_NAMESPACE, "vmm-prod"));

        harness.reconciler.reconcile_machine(&machine).await.unwrap();

        let connects = harness.connector.connects();
        assert_eq!(connects[0].scvmm_host, "vmm-prod");
        assert_eq!(connects[0].exec_host, "vmm-prod");
        assert_eq!(connects[0].username, "svc-capi");
    }

    #[tokio::test]
    async fn test_unparsable_memory_is_reported_without_remote_calls() {
        let harness = create_test_harness();
        let mut machine = create_test_finalized_machine("web-01");
        machine.spec.memory = Some("4GB".to_string());

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::None);
        assert!(harness.connector.connects().is_empty());
        assert!(harness.scvmm.calls().is_empty());
        let patched = harness.store.last_patch().unwrap();
        let created = condition(&patched, VM_CREATED_CONDITION);
        assert_eq!(created.reason.as_deref(), Some(VM_FAILED));
        assert_eq!(created.severity, Some(ConditionSeverity::Error));
        assert!(created.message.as_deref().unwrap().contains("4GB"));
        assert!(!patched.status.as_ref().unwrap().ready);
    }

    #[tokio::test]
    async fn test_unparsable_disk_size_blocks_expansion() {
        let harness = create_test_harness();
        let mut machine = named_machine("web-01");
        machine.spec.disks[0].size = Some("20 gigs".to_string());
        harness.scvmm.insert_vm(remote_vm("web-01", "PowerOff", 10 * GIB));

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::None);
        assert!(harness.scvmm.mutating_calls().is_empty());
        let patched = harness.store.last_patch().unwrap();
        assert_eq!(condition(&patched, VM_CREATED_CONDITION).reason.as_deref(), Some(VM_FAILED));
    }

    #[tokio::test]
    async fn test_read_vm_failure_is_recorded() {
        let harness = create_test_harness();
        let machine = named_machine("web-01");
        let mut vm = remote_vm("web-01", "Running", 10 * GIB);
        vm.ipv4_addresses = vec!["10.0.0.5".to_string()];
        harness.scvmm.insert_vm(vm);
        harness.scvmm.fail_with("ReadVM", "guest tools unreachable");

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(60)));
        let patched = harness.store.last_patch().unwrap();
        let running = condition(&patched, VM_RUNNING_CONDITION);
        assert_eq!(running.reason.as_deref(), Some(VM_FAILED));
        assert_eq!(running.severity, Some(ConditionSeverity::Error));
        assert!(running.message.as_deref().unwrap().contains("guest tools unreachable"));
        assert!(!is_condition_true(&patched.status.as_ref().unwrap().conditions, READY_CONDITION));
    }

    #[tokio::test]
    async fn test_guest_info_is_read_again_when_it_disappears() {
        let harness = create_test_harness();
        let mut machine = named_machine("web-01");
        let status = machine.status_mut();
        status.addresses = vec![MachineAddress {
            type_: MachineAddressType::InternalIP,
            address: "10.0.0.5".to_string(),
        }];
        status.hostname = "web-01.corp.local".to_string();
        harness.scvmm.insert_vm(remote_vm("web-01", "Running", 10 * GIB));

        let requeue = harness.reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(requeue, Requeue::After(Duration::from_secs(60)));
        assert_eq!(harness.scvmm.calls(), vec!["GetVM", "ReadVM"]);
    }
}
