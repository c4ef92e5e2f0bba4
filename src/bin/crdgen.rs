//! Print the `Motis` CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > deploy/crd.yaml
//! ```

use kube::CustomResourceExt;
use motis_operator::crd::Motis;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Motis::crd())?);
    Ok(())
}
