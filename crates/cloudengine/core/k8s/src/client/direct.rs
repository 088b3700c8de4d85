use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{DynamicObject, PostParams},
    Api, Client, Error, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{instrument, Level};

use crate::{
    name::NamespacedName,
    scheme::{Scheme, TypeKey},
};

use super::{ClientError, ObjectClient};

/// Talks to the API server on every call, resolving kinds through the
/// [`Scheme`].
#[derive(Clone)]
pub struct DirectClient {
    field_manager: String,
    kube: Client,
    scheme: Arc<Scheme>,
}

impl DirectClient {
    pub fn new(kube: Client, scheme: Arc<Scheme>, field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            kube,
            scheme,
        }
    }

    pub fn kube(&self) -> &Client {
        &self.kube
    }

    fn api(
        &self,
        key: &TypeKey,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClientError> {
        let (api_resource, namespaced) = self.scheme.api_resource(key)?;
        match namespace {
            Some(namespace) if namespaced => Ok(Api::namespaced_with(
                self.kube.clone(),
                namespace,
                &api_resource,
            )),
            Some(_) => Err(ClientError::Fatal(format!(
                "{key} is cluster-scoped, but a namespace was given"
            ))),
            None if namespaced => Err(ClientError::Fatal(format!(
                "{key} is namespaced, but no namespace was given"
            ))),
            None => Ok(Api::all_with(self.kube.clone(), &api_resource)),
        }
    }
}

#[async_trait]
impl ObjectClient for DirectClient {
    #[instrument(level = Level::DEBUG, skip(self), err(Display))]
    async fn get<K>(&self, name: &NamespacedName) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Send,
    {
        let key = TypeKey::of::<K>();
        let api = self.api(&key, name.namespace.as_deref())?;
        let object = api
            .get(&name.name)
            .await
            .map_err(|error| classify(error, &key, name))?;
        decode(object)
    }

    #[instrument(level = Level::DEBUG, skip_all, err(Display))]
    async fn create<K>(&self, object: &K) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Send + Sync,
    {
        let key = TypeKey::of::<K>();
        let name = super::object_name(object)?;
        let api = self.api(&key, name.namespace.as_deref())?;

        let data: DynamicObject = ::serde_json::to_value(object)
            .and_then(::serde_json::from_value)
            .map_err(|error| ClientError::Fatal(format!("failed to encode {key}: {error}")))?;
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        };
        let created = api
            .create(&pp, &data)
            .await
            .map_err(|error| classify(error, &key, &name))?;
        decode(created)
    }
}

fn decode<K>(object: DynamicObject) -> Result<K, ClientError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    ::serde_json::to_value(object)
        .and_then(::serde_json::from_value)
        .map_err(|error| {
            let kind = K::kind(&());
            ClientError::Fatal(format!("failed to decode {kind}: {error}"))
        })
}

/// Sorts kube errors into the classes the bootstrap protocol acts upon.
pub(super) fn classify(error: Error, key: &TypeKey, name: &NamespacedName) -> ClientError {
    match error {
        Error::Api(response) => match response.code {
            404 => ClientError::NotFound {
                kind: key.kind.clone(),
                name: name.clone(),
            },
            409 if response.reason == "AlreadyExists" => ClientError::AlreadyExists {
                kind: key.kind.clone(),
                name: name.clone(),
            },
            409 | 429 | 500..=599 => ClientError::Transient(response.message),
            _ => ClientError::Fatal(response.message),
        },
        error @ (Error::HyperError(_) | Error::Service(_)) => {
            ClientError::Transient(error.to_string())
        }
        error => ClientError::Fatal(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;

    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{code} {reason}"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classify_api_errors() {
        let key = TypeKey::new("example.io", "v1", "Widget");
        let name = NamespacedName::namespaced("default", "sample");

        let cases = [
            (404, "NotFound", "not_found"),
            (409, "AlreadyExists", "already_exists"),
            (409, "Conflict", "transient"),
            (429, "TooManyRequests", "transient"),
            (500, "InternalError", "transient"),
            (503, "ServiceUnavailable", "transient"),
            (403, "Forbidden", "fatal"),
            (422, "Invalid", "fatal"),
        ];

        for (code, reason, expected) in cases {
            let error = classify(api_error(code, reason), &key, &name);
            let actual = match &error {
                ClientError::NotFound { .. } => "not_found",
                ClientError::AlreadyExists { .. } => "already_exists",
                ClientError::Transient(_) => "transient",
                ClientError::Fatal(_) => "fatal",
                ClientError::Scheme(_) => "scheme",
            };
            assert_eq!(actual, expected, "{code} {reason}");
        }
    }
}
