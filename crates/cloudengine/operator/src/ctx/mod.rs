mod custom_cluster;
mod experiment;

use cloudengine_core_k8s::{
    client::DirectClient,
    manager::{Manager, RegistrationError},
};

/// Adds every controller of the operator to `manager`.
pub(crate) fn register(
    manager: &mut Manager,
    client: &DirectClient,
) -> Result<(), RegistrationError> {
    manager
        .register_ctx(client.clone(), self::custom_cluster::Ctx::default())?
        .register_ctx(client.clone(), self::experiment::Ctx::default())?;
    Ok(())
}
