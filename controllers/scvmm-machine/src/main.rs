//! SCVMM Machine Controller
//!
//! Cluster API infrastructure controller for Virtual Machine Manager:
//! - ScvmmMachine: creates, starts and removes the backing SCVMM VM
//! - Bootstrap data is delivered as a cloud-init NoCloud ISO
//!
//! All SCVMM operations run as PowerShell functions in a remote WinRM session.

mod backoff;
mod bootstrap;
mod conditions;
mod config;
mod controller;
mod error;
mod provider;
mod reconciler;
mod store;
mod test_utils;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use scvmm_client::FunctionLibrary;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting SCVMM Machine Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Script dir: {}", config.script_dir.display());
    info!("  Default SCVMM host: {}", config.defaults.scvmm_host);
    info!(
        "  WinRM port: {} (https: {}, auth: {})",
        config.winrm_port, config.winrm_https, config.winrm_auth
    );
    info!("  Extra debug: {}", config.extra_debug);

    let library = FunctionLibrary::load(&config.script_dir)
        .map_err(|e| ControllerError::InvalidConfig(format!("failed to load PowerShell functions: {}", e)))?;
    info!("Loaded {} PowerShell functions", library.len());

    let controller = Controller::new(config, library).await?;
    controller.run().await?;

    Ok(())
}
