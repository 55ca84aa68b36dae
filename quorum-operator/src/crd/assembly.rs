//! QuorumAssembly Custom Resource Definition.
//!
//! Declares one coordination ensemble, one data-plane cluster and an optional
//! companion process, managed together as a single unit.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// QuorumAssembly is the Schema for the quorumassemblies API.
///
/// The operator renders a Service, headless Service, ConfigMap, optional
/// PersistentVolumeClaims and a StatefulSet for both the ensemble and the
/// cluster, the shared certificate Secrets, and the companion Deployment.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "quorum.io",
    version = "v1",
    kind = "QuorumAssembly",
    plural = "quorumassemblies",
    shortname = "qa",
    namespaced,
    status = "QuorumAssemblyStatus",
    printcolumn = r#"{"name":"Ensemble", "type":"integer", "jsonPath":".spec.ensemble.replicas"}"#,
    printcolumn = r#"{"name":"Cluster", "type":"integer", "jsonPath":".spec.cluster.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QuorumAssemblySpec {
    /// Coordination ensemble.
    pub ensemble: ReplicaSetSpec,

    /// Data-plane cluster.
    pub cluster: ReplicaSetSpec,

    /// Companion controller process. Removing it deletes the Deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub companion: Option<CompanionSpec>,
}

/// One ordered, replicated server set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    /// Number of replicas.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container image. Falls back to the component default when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Storage for each replica.
    #[serde(default)]
    pub storage: StorageSpec,

    /// CPU and memory requests and limits.
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Metrics exporter configuration. Presence enables the metrics port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, String>>,

    /// Server configuration rendered into the ConfigMap.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Extra environment variables for the server container.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

fn default_replicas() -> i32 {
    3
}

impl Default for ReplicaSetSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            image: None,
            storage: StorageSpec::default(),
            resources: ResourceRequirements::default(),
            metrics: None,
            config: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Storage type.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    /// emptyDir volume, lost with the pod.
    #[default]
    Ephemeral,
    /// One PersistentVolumeClaim per replica.
    PersistentClaim,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage type.
    #[serde(rename = "type", default)]
    pub storage_type: StorageType,

    /// Claim size (e.g., "10Gi"). Required for persistent-claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Storage class name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Delete claims when the assembly is deleted.
    #[serde(default)]
    pub delete_claim: bool,
}

/// Resource requirements.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,

    /// Resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
}

/// Resource specification (CPU and memory).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU (e.g., "1", "500m").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory (e.g., "1Gi", "512Mi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Companion process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompanionSpec {
    /// Container image.
    #[serde(default = "default_companion_image")]
    pub image: String,

    /// Namespace the companion watches. Defaults to the assembly namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watched_namespace: Option<String>,

    /// Companion reconciliation interval.
    #[serde(default = "default_companion_interval")]
    pub reconcile_interval_seconds: i32,

    /// CPU and memory requests and limits.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

fn default_companion_image() -> String {
    "ghcr.io/quorum-io/companion:latest".to_string()
}

fn default_companion_interval() -> i32 {
    90
}

impl Default for CompanionSpec {
    fn default() -> Self {
        Self {
            image: default_companion_image(),
            watched_namespace: None,
            reconcile_interval_seconds: default_companion_interval(),
            resources: ResourceRequirements::default(),
        }
    }
}

/// QuorumAssembly status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuorumAssemblyStatus {
    /// Generation of the spec last reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AssemblyCondition>,

    /// Ensemble replica counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<ReplicaStatus>,

    /// Cluster replica counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ReplicaStatus>,
}

/// Replica counts for one replica set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Pods that exist.
    pub replicas: i32,
    /// Pods reporting Ready.
    pub ready_replicas: i32,
}

/// Condition representing assembly state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyCondition {
    /// Type of condition (Ready).
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown).
    pub status: String,

    /// Last time the condition transitioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
