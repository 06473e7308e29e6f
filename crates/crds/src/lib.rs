//! SCVMM Provider CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the SCVMM infrastructure
//! provider, plus the subset of Cluster API types the machine controller
//! reads from the management cluster.

pub mod capi;
pub mod conditions;
pub mod quantity;
pub mod references;
pub mod scvmm_cluster;
pub mod scvmm_machine;
pub mod scvmm_provider;

pub use capi::*;
pub use conditions::*;
pub use quantity::*;
pub use references::*;
pub use scvmm_cluster::*;
pub use scvmm_machine::*;
pub use scvmm_provider::*;
