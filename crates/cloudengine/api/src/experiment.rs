use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::consts::META_CLUSTER_NAME;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    category = "hackathon",
    group = "hackathon.kaiyuanshe.cn",
    version = "v1",
    kind = "Experiment",
    root = "ExperimentCrd",
    status = "ExperimentStatus",
    shortname = "exp",
    namespaced,
    printcolumn = r#"{
        "name": "cluster",
        "type": "string",
        "description": "target cluster",
        "jsonPath": ".spec.cluster"
    }"#,
    printcolumn = r#"{
        "name": "state",
        "type": "string",
        "description": "state of the experiment",
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
pub struct ExperimentSpec {
    /// Name of the `CustomCluster` (in the same namespace) to run on
    #[serde(default = "ExperimentSpec::default_cluster")]
    pub cluster: String,
    pub template: String,
    #[serde(default)]
    pub pause: bool,
}

impl ExperimentSpec {
    fn default_cluster() -> String {
        META_CLUSTER_NAME.into()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    #[serde(default)]
    pub state: ExperimentState,
    #[serde(default)]
    pub message: Option<String>,
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
pub enum ExperimentState {
    #[default]
    Pending,
    Running,
    Paused,
}
