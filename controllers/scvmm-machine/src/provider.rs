//! Provider resolution
//!
//! Works out which SCVMM server to talk to and how. Each field is taken from
//! the first source that has it: the referenced `ScvmmProvider`, the secret
//! it references (credentials only), the environment defaults, and finally a
//! value computed from the management host.

use crate::config::{ControllerConfig, ProviderDefaults};
use crate::error::ControllerError;
use crate::store::ResourceStore;
use crds::ProviderReference;
use k8s_openapi::api::core::v1::Secret;
use scvmm_client::{FunctionLibrary, SessionConfig};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Fully resolved connection settings for one machine
#[derive(Clone)]
pub struct ProviderConfig {
    pub scvmm_host: String,
    pub exec_host: String,
    pub username: String,
    pub password: String,
    /// Library share the cloud-init ISOs are written to
    pub library_path: String,
    pub ad_server: String,
    pub functions: Arc<FunctionLibrary>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("scvmm_host", &self.scvmm_host)
            .field("exec_host", &self.exec_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("library_path", &self.library_path)
            .field("ad_server", &self.ad_server)
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl ProviderConfig {
    pub fn session_config(&self, config: &ControllerConfig) -> SessionConfig {
        let mut session = SessionConfig::new(&self.exec_host, &self.scvmm_host, &self.username, &self.password);
        session.port = config.winrm_port;
        session.https = config.winrm_https;
        session.auth = config.winrm_auth;
        session.library = self.functions.clone();
        session.extra_debug = config.extra_debug;
        session
    }

    /// `<library>\<vmName>-cloud-init.iso`
    pub fn iso_path(&self, vm_name: &str) -> String {
        format!("{}\\{}-cloud-init.iso", self.library_path, vm_name)
    }
}

/// Default library share on the management server
pub fn default_library_path(scvmm_host: &str) -> String {
    format!("\\\\{}\\MSSCVMMLibrary\\ISOs\\cloud-init", scvmm_host)
}

fn first_set(candidates: &[&String]) -> String {
    candidates
        .iter()
        .find(|v| !v.is_empty())
        .map(|v| (*v).clone())
        .unwrap_or_default()
}

fn secret_string(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .cloned()
        })
        .unwrap_or_default()
}

/// Resolve the provider for a machine
///
/// `namespace` is used for a reference without one. A missing management
/// host is a configuration error; a referenced object that does not exist
/// (yet) is an ordinary retryable error.
pub async fn resolve_provider(
    store: &dyn ResourceStore,
    defaults: &ProviderDefaults,
    library: &Arc<FunctionLibrary>,
    provider_ref: Option<&ProviderReference>,
    namespace: &str,
) -> Result<ProviderConfig, ControllerError> {
    let mut spec = None;
    let mut username = String::new();
    let mut password = String::new();

    if let Some(reference) = provider_ref {
        let provider_namespace = reference.namespace_or(namespace);
        let provider = store
            .provider(provider_namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                ControllerError::ProviderNotFound(format!("{}/{}", provider_namespace, reference.name))
            })?;

        if let Some(secret_ref) = &provider.spec.secret_ref {
            let secret = store
                .secret(provider_namespace, &secret_ref.name)
                .await?
                .ok_or_else(|| {
                    ControllerError::SecretNotFound(format!("{}/{}", provider_namespace, secret_ref.name))
                })?;
            username = secret_string(&secret, "username");
            password = secret_string(&secret, "password");
        }
        spec = Some(provider.spec);
    }
    let spec = spec.unwrap_or_default();

    let scvmm_host = first_set(&[&spec.scvmm_host, &defaults.scvmm_host]);
    if scvmm_host.is_empty() {
        return Err(ControllerError::InvalidConfig(
            "missing required value ScvmmHost".to_string(),
        ));
    }

    let functions = if spec.extra_functions.is_empty() {
        library.clone()
    } else {
        Arc::new(library.with_overrides(&spec.extra_functions))
    };

    let exec_host = first_set(&[&spec.exec_host, &defaults.exec_host, &scvmm_host]);
    let fallback_library = default_library_path(&scvmm_host);
    let library_path = first_set(&[&spec.scvmm_library_isos, &defaults.library, &fallback_library]);

    let provider = ProviderConfig {
        scvmm_host,
        exec_host,
        username: first_set(&[&username, &defaults.username]),
        password: first_set(&[&password, &defaults.password]),
        library_path,
        ad_server: first_set(&[&spec.ad_server, &defaults.ad_server]),
        functions,
    };
    debug!("Resolved provider {:?}", provider);
    Ok(provider)
}
