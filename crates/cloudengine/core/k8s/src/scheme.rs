//! Write-once registry mapping resource kinds to their structural definitions.
//!
//! A [`SchemeBuilder`] is only mutated during bootstrap. Clients and managers
//! accept the frozen [`Scheme`] alone, so every registration is complete
//! before the first typed call.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    core::ApiResource,
    runtime::wait::{await_condition, conditions},
    Api, Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, instrument, Level};

const SCOPE_NAMESPACED: &str = "Namespaced";

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    pub fn of<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", &self.group, &self.version)
        }
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), &self.kind)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDefinition {
    pub plural: String,
    pub namespaced: bool,
    pub schema: Option<JSONSchemaProps>,
}

#[derive(Debug, Error)]
pub enum SchemeError {
    #[error("conflicting definition for {key}")]
    Conflict { key: TypeKey },
    #[error("conflicting CRD {name:?}")]
    ConflictingCrd { name: String },
    #[error("{key} is not registered")]
    Unregistered { key: TypeKey },
    #[error("invalid definition {name:?}: {reason}")]
    Invalid { name: String, reason: &'static str },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: ::std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ::serde_yaml::Error,
    },
    #[error("failed to install CRD {name:?}: {reason}")]
    Install { name: String, reason: String },
}

#[derive(Clone, Debug, Default)]
pub struct Scheme {
    crds: BTreeMap<String, CustomResourceDefinition>,
    types: BTreeMap<TypeKey, TypeDefinition>,
}

impl Scheme {
    pub fn builder() -> SchemeBuilder {
        SchemeBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn contains(&self, key: &TypeKey) -> bool {
        self.types.contains_key(key)
    }

    pub fn crds(&self) -> impl Iterator<Item = &CustomResourceDefinition> {
        self.crds.values()
    }

    pub fn resolve(&self, key: &TypeKey) -> Result<&TypeDefinition, SchemeError> {
        self.types
            .get(key)
            .ok_or_else(|| SchemeError::Unregistered { key: key.clone() })
    }

    pub fn api_resource(&self, key: &TypeKey) -> Result<(ApiResource, bool), SchemeError> {
        let definition = self.resolve(key)?;
        let api_resource = ApiResource {
            group: key.group.clone(),
            version: key.version.clone(),
            api_version: key.api_version(),
            kind: key.kind.clone(),
            plural: definition.plural.clone(),
        };
        Ok((api_resource, definition.namespaced))
    }

    /// Creates or server-side-applies every registered CRD, then waits until
    /// each one is established.
    #[instrument(level = Level::INFO, skip(self, kube), err(Display))]
    pub async fn install(
        &self,
        kube: Client,
        field_manager: &str,
        establish_timeout: Duration,
    ) -> Result<(), SchemeError> {
        let api = Api::<CustomResourceDefinition>::all(kube);

        for crd in self.crds() {
            let name = crd.name_any();
            let install_error = |reason: String| SchemeError::Install {
                name: name.clone(),
                reason,
            };

            let exists = api
                .get_opt(&name)
                .await
                .map_err(|error| install_error(error.to_string()))?
                .is_some();
            if exists {
                let pp = PatchParams {
                    dry_run: false,
                    force: true,
                    field_manager: Some(field_manager.into()),
                    ..Default::default()
                };
                api.patch(&name, &pp, &Patch::Apply(crd))
                    .await
                    .map_err(|error| install_error(error.to_string()))?;
                info!("Updated CRD: {name}");
            } else {
                let pp = PostParams {
                    dry_run: false,
                    field_manager: Some(field_manager.into()),
                };
                api.create(&pp, crd)
                    .await
                    .map_err(|error| install_error(error.to_string()))?;
                info!("Created CRD: {name}");
            }

            let established = await_condition(api.clone(), &name, conditions::is_crd_established());
            match timeout(establish_timeout, established).await {
                Ok(Ok(_)) => debug!("CRD is established: {name}"),
                Ok(Err(error)) => return Err(install_error(error.to_string())),
                Err(_) => {
                    return Err(install_error(format!(
                        "not established within {establish_timeout:?}"
                    )))
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SchemeBuilder {
    scheme: Scheme,
}

impl SchemeBuilder {
    pub fn register<K>(&mut self) -> Result<&mut Self, SchemeError>
    where
        K: CustomResourceExt,
    {
        self.register_crd(K::crd())
    }

    /// Registers every version of the given CRD.
    ///
    /// Registering an identical definition again is a no-op; a differing one
    /// fails without modifying the registry.
    pub fn register_crd(
        &mut self,
        crd: CustomResourceDefinition,
    ) -> Result<&mut Self, SchemeError> {
        let name = crd.name_any();
        let invalid = |reason| SchemeError::Invalid {
            name: name.clone(),
            reason,
        };

        if let Some(existing) = self.scheme.crds.get(&name) {
            if existing != &crd {
                return Err(SchemeError::ConflictingCrd { name: name.clone() });
            }
        }

        let spec = &crd.spec;
        if spec.names.kind.is_empty() {
            return Err(invalid("missing kind"));
        }
        if spec.names.plural.is_empty() {
            return Err(invalid("missing plural name"));
        }
        if spec.versions.is_empty() {
            return Err(invalid("no versions"));
        }

        let definitions: Vec<_> = spec
            .versions
            .iter()
            .map(|version| {
                let key = TypeKey::new(&spec.group, &version.name, &spec.names.kind);
                let definition = TypeDefinition {
                    plural: spec.names.plural.clone(),
                    namespaced: spec.scope == SCOPE_NAMESPACED,
                    schema: version
                        .schema
                        .as_ref()
                        .and_then(|schema| schema.open_api_v3_schema.clone()),
                };
                (key, definition)
            })
            .collect();

        for (key, definition) in &definitions {
            if let Some(existing) = self.scheme.types.get(key) {
                if existing != definition {
                    return Err(SchemeError::Conflict { key: key.clone() });
                }
            }
        }

        for (key, definition) in definitions {
            if self.scheme.types.contains_key(&key) {
                debug!("already registered: {key}");
            } else {
                debug!("registered: {key}");
                self.scheme.types.insert(key, definition);
            }
        }
        self.scheme.crds.entry(name).or_insert(crd);
        Ok(self)
    }

    /// Loads every `*.yaml` and `*.yml` file in `path`, registering each
    /// `CustomResourceDefinition` document and skipping the others.
    #[instrument(level = Level::INFO, skip(self, path), fields(path = %path.as_ref().display()), err(Display))]
    pub async fn register_dir(&mut self, path: impl AsRef<Path>) -> Result<usize, SchemeError> {
        let path = path.as_ref();
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SchemeError::Io { path, source }
        };

        let mut files = Vec::default();
        let mut entries = ::tokio::fs::read_dir(path).await.map_err(io_error(path))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(path))? {
            let file = entry.path();
            if matches!(
                file.extension().and_then(|ext| ext.to_str()),
                Some("yaml" | "yml"),
            ) {
                files.push(file);
            }
        }
        files.sort();

        let mut count = 0;
        for file in files {
            let text = ::tokio::fs::read_to_string(&file)
                .await
                .map_err(io_error(&file))?;
            let crds = parse_crds(&text).map_err(|source| SchemeError::Parse {
                path: file.clone(),
                source,
            })?;
            for crd in crds {
                self.register_crd(crd)?;
                count += 1;
            }
        }
        info!("loaded {count} CRD(s)");
        Ok(count)
    }

    pub fn build(self) -> Scheme {
        self.scheme
    }
}

fn parse_crds(text: &str) -> Result<Vec<CustomResourceDefinition>, ::serde_yaml::Error> {
    let mut crds = Vec::default();
    for document in ::serde_yaml::Deserializer::from_str(text) {
        let value = ::serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }

        let kind = value.get("kind").and_then(|kind| kind.as_str());
        if kind == Some("CustomResourceDefinition") {
            crds.push(::serde_yaml::from_value(value)?);
        } else {
            debug!("skipping non-CRD document: {kind:?}");
        }
    }
    Ok(crds)
}
