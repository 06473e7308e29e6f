//! Process configuration
//!
//! Read once from the environment at startup and passed to the reconciler.
//! The SCVMM values are the lowest-priority defaults of provider resolution;
//! an `ScvmmProvider` object or its secret overrides them per machine.

use crate::error::ControllerError;
use scvmm_client::{AuthMethod, DEFAULT_WINRM_PORT};
use std::fmt;
use std::path::PathBuf;

/// Default location of the PowerShell function library
pub const DEFAULT_SCRIPT_DIR: &str = "/scripts";

/// Environment-derived provider defaults
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProviderDefaults {
    pub scvmm_host: String,
    pub exec_host: String,
    pub username: String,
    pub password: String,
    pub library: String,
    pub ad_server: String,
}

impl fmt::Debug for ProviderDefaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDefaults")
            .field("scvmm_host", &self.scvmm_host)
            .field("exec_host", &self.exec_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("library", &self.library)
            .field("ad_server", &self.ad_server)
            .finish()
    }
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    /// Directory of `*.ps1` function bodies
    pub script_dir: PathBuf,
    /// Verbose session handshake and command logging
    pub extra_debug: bool,
    pub defaults: ProviderDefaults,
    pub winrm_port: u16,
    pub winrm_https: bool,
    pub winrm_auth: AuthMethod,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            script_dir: PathBuf::from(DEFAULT_SCRIPT_DIR),
            extra_debug: false,
            defaults: ProviderDefaults::default(),
            winrm_port: DEFAULT_WINRM_PORT,
            winrm_https: false,
            winrm_auth: AuthMethod::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).unwrap_or_default();

        let winrm_port = match lookup("WINRM_PORT").filter(|v| !v.is_empty()) {
            Some(port) => port.parse::<u16>().map_err(|e| {
                ControllerError::InvalidConfig(format!("WINRM_PORT '{}' is not a valid port: {}", port, e))
            })?,
            None => DEFAULT_WINRM_PORT,
        };

        let winrm_auth = match lookup("WINRM_AUTH").filter(|v| !v.is_empty()) {
            Some(auth) => auth.parse::<AuthMethod>().map_err(ControllerError::InvalidConfig)?,
            None => AuthMethod::default(),
        };

        Ok(Self {
            namespace: lookup("WATCH_NAMESPACE").filter(|v| !v.is_empty()),
            script_dir: lookup("SCRIPT_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT_DIR)),
            extra_debug: !var("EXTRA_DEBUG").is_empty(),
            defaults: ProviderDefaults {
                scvmm_host: var("SCVMM_HOST"),
                exec_host: var("SCVMM_EXECHOST"),
                username: var("SCVMM_USERNAME"),
                password: var("SCVMM_PASSWORD"),
                library: var("SCVMM_LIBRARY"),
                ad_server: var("ACTIVEDIRECTORY_SERVER"),
            },
            winrm_port,
            winrm_https: matches!(var("WINRM_HTTPS").to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            winrm_auth,
        })
    }
}
