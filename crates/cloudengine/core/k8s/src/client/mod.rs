//! Direct, uncached access to control-plane objects.
//!
//! Bootstrap-time reads must observe the true current state, not a cache
//! that has just started and may still be empty, so nothing here is backed by
//! a reflector or an informer.

mod direct;
mod memory;

pub use self::{
    direct::DirectClient,
    memory::{MemoryClient, MemoryStats},
};

use async_trait::async_trait;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{name::NamespacedName, scheme::SchemeError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: NamespacedName },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: NamespacedName },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait ObjectClient
where
    Self: Send + Sync,
{
    async fn get<K>(&self, name: &NamespacedName) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send;

    /// Creates `object` under the name in its metadata and returns the stored
    /// copy.
    async fn create<K>(&self, object: &K) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync;
}

fn object_name<K>(object: &K) -> Result<NamespacedName, ClientError>
where
    K: Resource<DynamicType = ()>,
{
    NamespacedName::of(object).ok_or_else(|| {
        let kind = K::kind(&());
        ClientError::Fatal(format!("cannot create a {kind} without a name"))
    })
}
