//! SCVMM Remote Client
//!
//! Drives Virtual Machine Manager through a remote PowerShell session over
//! WinRM. The session is seeded with a library of named functions (one per
//! remote operation); each call runs one function and decodes the single
//! JSON document it writes.
//!
//! # Example
//!
//! ```no_run
//! use scvmm_client::{ScvmmClient, ScvmmClientTrait, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("vmm-exec", "vmm", "svc-capi", "secret");
//! let client = ScvmmClient::connect(&config).await?;
//!
//! let vm = client.get_vm("web-01").await?;
//! if let Some(error) = vm.failure() {
//!     eprintln!("GetVM failed: {error}");
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod library;
pub mod models;
pub mod ntlm;
pub mod protocol;
#[path = "trait.rs"]
pub mod scvmm_trait;
pub mod session;
pub mod wsman;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{ScvmmClient, WinRmConnector};
pub use error::ScvmmError;
pub use library::FunctionLibrary;
pub use models::*;
pub use protocol::{CommandLine, CommandOutput, SpecPayload, VirtualDiskInfo, VmResult, VmSpecResult};
pub use scvmm_trait::{ScvmmClientTrait, ScvmmConnector};
pub use session::{SessionConfig, WinRmSession, DEFAULT_WINRM_PORT};
pub use wsman::AuthMethod;
#[cfg(feature = "test-util")]
pub use mock::{MockConnector, MockScvmmClient};
