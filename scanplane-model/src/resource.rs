//! Pipeline configuration records the scanner reads.
//!
//! These are owned by pipeline configuration apply; the scanning core only
//! ever reads them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{BaseResourceTypeId, PipelineId, ResourceId, ResourceTypeId};

/// Opaque resource configuration. `serde_json::Map` keeps keys sorted, which
/// keeps plan fingerprints stable.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// A concrete version emitted by a check, e.g. `{"ref": "abc123"}`.
pub type Version = BTreeMap<String, String>;

/// A configured external artifact source belonging to a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub pipeline_id: PipelineId,
    pub name: String,
    /// Name of the resource type interpreting this resource. Resolved against
    /// the pipeline's custom types first, then the base types.
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Version the pipeline pinned this resource to, if any.
    #[serde(default)]
    pub pinned_version: Option<Version>,
    #[serde(default)]
    pub check_timeout_secs: Option<u64>,
    pub config_version: i64,
}

/// A pipeline-scoped plugin used to interpret a resource or another type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub pipeline_id: PipelineId,
    pub name: String,
    /// Type used to fetch this type's image; either another custom type or a
    /// base type.
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    /// Latest image version found by the type's own check, pinned into
    /// dependent plans.
    #[serde(default)]
    pub version: Option<Version>,
    pub config_version: i64,
}

/// A resource type that ships with the workers and needs no image resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseResourceType {
    pub id: BaseResourceTypeId,
    pub name: String,
}
