use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::capp::LogType;

/// Log shipping pipeline for one Capp: which pods to collect from and where
/// to send the records.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "logging.rcs.dana.io",
    version = "v1alpha1",
    kind = "LogPipeline",
    plural = "logpipelines",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct LogPipelineSpec {
    /// Pod labels selecting the log sources
    pub selector: BTreeMap<String, String>,
    pub output: LogOutput,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogOutput {
    #[serde(rename = "type")]
    pub type_: LogType,
    pub host: String,
    pub index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_name: Option<String>,
}
