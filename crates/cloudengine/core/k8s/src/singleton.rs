//! Get-or-create protocol for a configuration object that must exist exactly
//! once per cluster.

use cloudengine_core::retry::RetryPolicy;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, instrument, warn, Level};

use crate::{
    client::{ClientError, ObjectClient},
    name::NamespacedName,
};

/// A kind with one well-known instance.
pub trait Singleton
where
    Self: Clone + Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync,
{
    fn well_known_name() -> NamespacedName;

    /// The object to create when none exists; its name is overwritten with
    /// [`Singleton::well_known_name`].
    fn new_default() -> Self;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ensured {
    /// The object already existed; nothing was written.
    Found,
    /// This call created the object.
    Created,
    /// A concurrent caller created the object first.
    CreatedByPeer,
}

#[derive(Debug, Error)]
pub enum EnsureError {
    #[error("failed to get {name}: {source}")]
    Get {
        name: NamespacedName,
        #[source]
        source: ClientError,
    },
    #[error("failed to create {name}: {source}")]
    Create {
        name: NamespacedName,
        #[source]
        source: ClientError,
    },
    #[error("gave up ensuring {name} after {attempts} attempts: {source}")]
    Exhausted {
        name: NamespacedName,
        attempts: u32,
        #[source]
        source: ClientError,
    },
    #[error("the ensure task was aborted")]
    Aborted,
}

pub struct SingletonEnsurer<C> {
    client: C,
    retry: RetryPolicy,
}

impl<C> SingletonEnsurer<C>
where
    C: ObjectClient,
{
    pub fn new(client: C) -> Self {
        Self::with_retry(client, RetryPolicy::default())
    }

    pub fn with_retry(client: C, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Makes sure the well-known `K` exists, creating it at most once per
    /// observed absence.
    ///
    /// Transient failures are retried within the retry budget and are never
    /// taken as absence. A transient `create` failure goes back to `get`,
    /// since the write may have landed anyway.
    #[instrument(level = Level::INFO, skip_all, fields(name = %K::well_known_name()), err(Display))]
    pub async fn ensure_exists<K>(&self) -> Result<Ensured, EnsureError>
    where
        K: Singleton,
    {
        let name = K::well_known_name();
        let mut backoff = self.retry.backoff();

        loop {
            let error = match self.client.get::<K>(&name).await {
                Ok(_) => {
                    info!("found {kind} {name}", kind = K::kind(&()));
                    return Ok(Ensured::Found);
                }
                Err(error) if error.is_not_found() => {
                    match self.client.create(&template::<K>(&name)).await {
                        Ok(_) => {
                            info!("created {kind} {name}", kind = K::kind(&()));
                            return Ok(Ensured::Created);
                        }
                        Err(error) if error.is_already_exists() => {
                            info!("{kind} {name} was created concurrently", kind = K::kind(&()));
                            return Ok(Ensured::CreatedByPeer);
                        }
                        Err(error) if error.is_transient() => error,
                        Err(source) => return Err(EnsureError::Create { name, source }),
                    }
                }
                Err(error) if error.is_transient() => error,
                Err(source) => return Err(EnsureError::Get { name, source }),
            };

            match backoff.next() {
                Some(delay) => {
                    warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis(),
                        "failed to ensure {name}, retrying: {error}"
                    );
                    sleep(delay).await;
                }
                None => {
                    return Err(EnsureError::Exhausted {
                        name,
                        attempts: backoff.attempts(),
                        source: error,
                    })
                }
            }
        }
    }
}

fn template<K>(name: &NamespacedName) -> K
where
    K: Singleton,
{
    let mut object = K::new_default();
    let metadata = object.meta_mut();
    metadata.name = Some(name.name.clone());
    metadata.namespace = name.namespace.clone();
    object
}
