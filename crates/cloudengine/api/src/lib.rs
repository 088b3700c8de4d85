pub mod consts;
pub mod custom_cluster;
pub mod experiment;

use cloudengine_core_k8s::scheme::{SchemeBuilder, SchemeError};

/// Registers every resource type of this API group.
pub fn add_to_scheme(builder: &mut SchemeBuilder) -> Result<(), SchemeError> {
    builder
        .register::<self::custom_cluster::CustomClusterCrd>()?
        .register::<self::experiment::ExperimentCrd>()?;
    Ok(())
}
