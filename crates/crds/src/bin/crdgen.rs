//! Print the SCVMM infrastructure CRDs as a multi-document YAML stream
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/scvmm.yaml`

use crds::{ScvmmCluster, ScvmmMachine, ScvmmProvider};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [ScvmmMachine::crd(), ScvmmCluster::crd(), ScvmmProvider::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
