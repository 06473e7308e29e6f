//! Remote PowerShell session
//!
//! One WinRM shell running `powershell.exe -Command -`, fed through stdin.
//! Each call writes a command followed by an end marker and reads stdout
//! until the marker comes back, so the interpreter (and everything the
//! function library defined) stays alive between calls.

use crate::error::ScvmmError;
use crate::library::FunctionLibrary;
use crate::protocol::{CommandLine, CommandOutput};
use crate::wsman::{AuthMethod, WsManClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const POWERSHELL: &str = "powershell.exe";
const POWERSHELL_ARGS: [&str; 4] = ["-NonInteractive", "-NoProfile", "-Command", "-"];

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Everything needed to open a session
#[derive(Clone)]
pub struct SessionConfig {
    /// Host the shell runs on
    pub exec_host: String,
    /// SCVMM server the shell connects to
    pub scvmm_host: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub https: bool,
    pub auth: AuthMethod,
    /// Functions defined in the shell before the first call
    pub library: Arc<FunctionLibrary>,
    /// Round-trip check before loading the library and verbose call logging
    pub extra_debug: bool,
    /// Server side timeout of a single receive
    pub operation_timeout: Duration,
    /// Upper bound on waiting for the answer of one call
    pub command_timeout: Duration,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("exec_host", &self.exec_host)
            .field("scvmm_host", &self.scvmm_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("https", &self.https)
            .field("auth", &self.auth)
            .field("functions", &self.library.len())
            .field("extra_debug", &self.extra_debug)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn new(exec_host: &str, scvmm_host: &str, username: &str, password: &str) -> Self {
        Self {
            exec_host: exec_host.to_string(),
            scvmm_host: scvmm_host.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            port: DEFAULT_WINRM_PORT,
            https: false,
            auth: AuthMethod::default(),
            library: Arc::new(FunctionLibrary::default()),
            extra_debug: false,
            operation_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct Running {
    shell_id: String,
    command_id: String,
}

/// An open, seeded PowerShell session
#[derive(Debug)]
pub struct WinRmSession {
    wsman: WsManClient,
    running: Option<Running>,
    marker: String,
    extra_debug: bool,
    command_timeout: Duration,
}

impl WinRmSession {
    /// Open a shell, start PowerShell and seed it with the function library
    ///
    /// Nothing is left running on the remote side when this fails.
    pub async fn open(config: &SessionConfig) -> Result<Self, ScvmmError> {
        let wsman = WsManClient::new(
            &config.exec_host,
            config.port,
            config.https,
            config.auth,
            &config.username,
            &config.password,
            config.operation_timeout,
        )?;

        if config.extra_debug {
            debug!("Creating WinRM shell on {}", wsman.url());
        }
        let shell_id = wsman
            .create_shell()
            .await
            .map_err(|e| ScvmmError::opening("Creating winrm shell", &e))?;

        if config.extra_debug {
            debug!("Starting powershell.exe in shell {}", shell_id);
        }
        let command_id = match wsman.start_command(&shell_id, POWERSHELL, &POWERSHELL_ARGS).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(del) = wsman.delete_shell(&shell_id).await {
                    warn!("Failed to delete shell {} after failed start: {}", shell_id, del);
                }
                return Err(ScvmmError::opening("Creating winrm powershell", &e));
            }
        };

        let mut session = Self {
            wsman,
            running: Some(Running { shell_id, command_id }),
            marker: format!("--end-{}--", Uuid::new_v4().simple()),
            extra_debug: config.extra_debug,
            command_timeout: config.command_timeout,
        };

        if let Err(e) = session.seed(config).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn seed(&mut self, config: &SessionConfig) -> Result<(), ScvmmError> {
        if self.extra_debug {
            debug!("Sending WinRM ping");
            self.expect_ok("Write-Host 'OK'", "Powershell ping").await?;
        }

        if self.extra_debug {
            debug!("Sending {} remote functions", config.library.len());
        }
        let output = self
            .invoke(&config.library.preamble())
            .await
            .map_err(|e| ScvmmError::opening("Sending powershell functions", &e))?;
        if !output.stderr.trim().is_empty() {
            warn!("Function library produced errors: {}", output.stderr.trim());
        }

        let mut check = String::new();
        if config.library.contains("ConnectSCVMM") {
            if self.extra_debug {
                debug!("Calling ConnectSCVMM for {}", config.scvmm_host);
            }
            check = CommandLine::new("ConnectSCVMM")
                .arg_str("Host", &config.scvmm_host)
                .arg_str("Username", &config.username)
                .arg_str("Password", &config.password)
                .to_string();
            check.push('\n');
        }
        check.push_str("Write-Host 'OK'");
        self.expect_ok(&check, "Powershell functions result").await
    }

    async fn expect_ok(&mut self, script: &str, what: &str) -> Result<(), ScvmmError> {
        let output = self
            .invoke(script)
            .await
            .map_err(|e| ScvmmError::opening(what, &e))?;
        if output.stdout.trim() != "OK" {
            return Err(ScvmmError::Transport(format!(
                "{what}: {} (ERR={})",
                output.stdout.trim(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Run `script` and collect what it wrote up to the end marker
    pub async fn invoke(&mut self, script: &str) -> Result<CommandOutput, ScvmmError> {
        let running = self.running.clone().ok_or(ScvmmError::Closed)?;
        let input = format!("{script}\nWrite-Host '{}'\n", self.marker);
        self.wsman
            .send(&running.shell_id, &running.command_id, input.as_bytes())
            .await?;

        match tokio::time::timeout(self.command_timeout, self.read_until_marker(&running)).await {
            Ok(result) => result,
            Err(_) => Err(ScvmmError::Transport(format!(
                "no answer within {}s",
                self.command_timeout.as_secs()
            ))),
        }
    }

    async fn read_until_marker(&self, running: &Running) -> Result<CommandOutput, ScvmmError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let chunk = self
                .wsman
                .receive(&running.shell_id, &running.command_id)
                .await?;
            stdout.extend(chunk.stdout);
            stderr.extend(chunk.stderr);

            let text = String::from_utf8_lossy(&stdout);
            if let Some(pos) = find_marker(&text, &self.marker) {
                return Ok(CommandOutput {
                    stdout: text[..pos].trim().to_string(),
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                });
            }
            if chunk.done {
                return Err(ScvmmError::Transport(format!(
                    "powershell exited: {} (ERR={})",
                    text.trim(),
                    String::from_utf8_lossy(&stderr).trim()
                )));
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    /// Terminate PowerShell and delete the shell; safe to call repeatedly
    pub async fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        if let Err(e) = self.wsman.terminate(&running.shell_id, &running.command_id).await {
            debug!("Terminate of command in shell {} failed: {}", running.shell_id, e);
        }
        if let Err(e) = self.wsman.delete_shell(&running.shell_id).await {
            warn!("Failed to delete shell {}: {}", running.shell_id, e);
        }
    }
}

/// Start of the marker line in `text`
fn find_marker(text: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim() == marker {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}
