//! SCVMM client errors

use thiserror::Error;

/// Errors raised while talking to the remote PowerShell session
///
/// A function that ran and reported its own failure is *not* an error at
/// this level; that arrives as a populated `Error`/`ScriptErrors` field on
/// the decoded result.
#[derive(Debug, Error)]
pub enum ScvmmError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Session open, send or receive failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// WS-Management fault returned by the remote endpoint
    #[error("WS-Management fault {code}: {reason}")]
    Fault { code: String, reason: String },

    /// Remote output was not the expected JSON document
    #[error("Decode result error: {source}: {stdout}  (stderr={stderr})")]
    Decode {
        #[source]
        source: serde_json::Error,
        stdout: String,
        stderr: String,
    },

    /// Encoding a call payload failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Function library could not be loaded
    #[error("Function library error: {0}")]
    Library(String),

    /// Session was already closed
    #[error("Session is closed")]
    Closed,
}

impl ScvmmError {
    /// Wrap a failure during session open with the step that failed
    pub(crate) fn opening(step: &str, err: &ScvmmError) -> Self {
        ScvmmError::Transport(format!("{step}: {err}"))
    }
}
