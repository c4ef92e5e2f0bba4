//! Custom Resource Definitions (CRDs) for motis-operator.
//!
//! - `Motis`: one managed MOTIS routing-engine instance

mod motis;

pub use motis::*;
