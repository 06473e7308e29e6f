//! Integration tests for the SCVMM client
//!
//! These tests require a reachable WinRM endpoint with the SCVMM cmdlets.
//! Set SCVMM_EXECHOST, SCVMM_HOST, SCVMM_USERNAME, SCVMM_PASSWORD and
//! SCRIPT_DIR (optionally WINRM_AUTH) to run.

use scvmm_client::{FunctionLibrary, ScvmmClient, ScvmmClientTrait, SessionConfig};
use std::sync::Arc;

fn config_from_env() -> SessionConfig {
    let scvmm_host = std::env::var("SCVMM_HOST").expect("SCVMM_HOST environment variable must be set");
    let exec_host = std::env::var("SCVMM_EXECHOST").unwrap_or_else(|_| scvmm_host.clone());
    let username = std::env::var("SCVMM_USERNAME").expect("SCVMM_USERNAME environment variable must be set");
    let password = std::env::var("SCVMM_PASSWORD").expect("SCVMM_PASSWORD environment variable must be set");
    let script_dir = std::env::var("SCRIPT_DIR").unwrap_or_else(|_| "/scripts".to_string());

    let mut config = SessionConfig::new(&exec_host, &scvmm_host, &username, &password);
    config.library = Arc::new(FunctionLibrary::load(script_dir).expect("Failed to load function library"));
    if let Ok(auth) = std::env::var("WINRM_AUTH") {
        config.auth = auth.parse().expect("WINRM_AUTH must be ntlm or basic");
    }
    config.extra_debug = true;
    config
}

#[tokio::test]
#[ignore] // Requires a running SCVMM installation
async fn test_session_open_and_close() {
    let client = ScvmmClient::connect(&config_from_env())
        .await
        .expect("Failed to open session");
    client.close().await;
    client.close().await;
}

#[tokio::test]
#[ignore]
async fn test_get_missing_vm() {
    let client = ScvmmClient::connect(&config_from_env())
        .await
        .expect("Failed to open session");

    let vm = client
        .get_vm("capi-integration-test-does-not-exist")
        .await
        .expect("Failed to call GetVM");
    assert!(!vm.exists());

    client.close().await;
}
