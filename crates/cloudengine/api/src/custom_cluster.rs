use chrono::{DateTime, Utc};
use cloudengine_core_k8s::{name::NamespacedName, singleton::Singleton};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::consts::{META_CLUSTER_NAME, META_CLUSTER_NAMESPACE};

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, CustomResource,
)]
#[kube(
    category = "hackathon",
    group = "hackathon.kaiyuanshe.cn",
    version = "v1",
    kind = "CustomCluster",
    root = "CustomClusterCrd",
    status = "CustomClusterStatus",
    shortname = "cc",
    namespaced,
    printcolumn = r#"{
        "name": "meta",
        "type": "boolean",
        "description": "whether this is the meta cluster",
        "jsonPath": ".spec.meta"
    }"#,
    printcolumn = r#"{
        "name": "state",
        "type": "string",
        "description": "state of the cluster",
        "jsonPath": ".status.state"
    }"#,
    printcolumn = r#"{
        "name": "updated-at",
        "type": "date",
        "description": "updated time",
        "jsonPath": ".status.lastUpdated"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct CustomClusterSpec {
    #[serde(default)]
    pub description: Option<String>,
    /// The meta cluster hosts the shared operator configuration
    #[serde(default)]
    pub meta: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomClusterStatus {
    #[serde(default)]
    pub state: CustomClusterState,
    pub last_updated: DateTime<Utc>,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    EnumString,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum CustomClusterState {
    #[default]
    Pending,
    Ready,
}

impl Singleton for CustomClusterCrd {
    fn well_known_name() -> NamespacedName {
        NamespacedName::namespaced(META_CLUSTER_NAMESPACE, META_CLUSTER_NAME)
    }

    fn new_default() -> Self {
        Self::new(
            META_CLUSTER_NAME,
            CustomClusterSpec {
                description: Some("shared configuration of the cloudengine operator".into()),
                meta: true,
            },
        )
    }
}
