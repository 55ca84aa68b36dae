//! Orchestration platform seam.
//!
//! Every resource kind the operator manages is one variant of [`ResourceKind`].
//! The [`Platform`] trait exposes the verbs the operators need for any kind,
//! with objects crossing the seam as JSON; [`ManagedResource`] ties each typed
//! Kubernetes object to its kind tag so the operators stay strongly typed.
//!
//! Two implementations exist:
//!
//! - [`KubePlatform`]: the real API server through `kube::Client`
//! - [`memory::InMemoryPlatform`]: an in-process store that simulates the
//!   StatefulSet controller, used by tests and local development

mod kube_client;
pub mod memory;
pub mod merge;

pub use kube_client::KubePlatform;

use crate::crd::QuorumAssembly;
use crate::error::OperatorResult;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Field manager name used for server-side apply.
pub const FIELD_MANAGER: &str = "quorum-operator";

/// Type alias for async platform futures.
pub type PlatformFuture<'a, T> = Pin<Box<dyn Future<Output = OperatorResult<T>> + Send + 'a>>;

/// Label selector as `matchLabels`.
pub type Labels = BTreeMap<String, String>;

/// The closed set of resource kinds the operator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// core/v1 Service.
    Service,
    /// core/v1 ConfigMap.
    ConfigMap,
    /// core/v1 Secret.
    Secret,
    /// core/v1 PersistentVolumeClaim.
    PersistentVolumeClaim,
    /// apps/v1 StatefulSet.
    StatefulSet,
    /// core/v1 Pod.
    Pod,
    /// apps/v1 Deployment.
    Deployment,
    /// quorum.io/v1 QuorumAssembly.
    QuorumAssembly,
}

impl ResourceKind {
    /// Kind name as it appears in `kind:`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Pod => "Pod",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::QuorumAssembly => "QuorumAssembly",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed object that belongs to one [`ResourceKind`].
pub trait ManagedResource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind tag for this type.
    const KIND: ResourceKind;
}

impl ManagedResource for Service {
    const KIND: ResourceKind = ResourceKind::Service;
}

impl ManagedResource for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;
}

impl ManagedResource for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;
}

impl ManagedResource for PersistentVolumeClaim {
    const KIND: ResourceKind = ResourceKind::PersistentVolumeClaim;
}

impl ManagedResource for StatefulSet {
    const KIND: ResourceKind = ResourceKind::StatefulSet;
}

impl ManagedResource for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;
}

impl ManagedResource for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;
}

impl ManagedResource for QuorumAssembly {
    const KIND: ResourceKind = ResourceKind::QuorumAssembly;
}

/// Namespaced object store verbs, keyed by kind.
///
/// # Implementation Notes
///
/// - `get` returns `None` for a missing object rather than an error
/// - `list` with `namespace = None` lists across all namespaces
/// - `apply` is server-side apply as [`FIELD_MANAGER`]: the object is created
///   when absent, and fields applied before but missing now are removed
/// - a `metadata.resourceVersion` in an applied object must match the stored
///   object or the call fails with a conflict
/// - an apply that changes nothing leaves the resource version unchanged
/// - `delete` returns `false` when there was nothing to delete
pub trait Platform: Send + Sync {
    /// Read one object.
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, Option<Value>>;

    /// List objects matching all the given labels.
    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: &'a Labels,
    ) -> PlatformFuture<'a, Vec<Value>>;

    /// Server-side apply the full desired object, returning the stored result.
    fn apply<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        object: Value,
    ) -> PlatformFuture<'a, Value>;

    /// Delete an object.
    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, bool>;

    /// Merge-patch the status sub-resource of an object.
    fn patch_status<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        status: Value,
    ) -> PlatformFuture<'a, ()>;
}

/// Raw REST request against the platform API.
#[derive(Debug, Clone)]
pub struct RestRequest {
    /// HTTP method.
    pub method: http::Method,
    /// Path relative to the API server root, without a leading slash.
    pub path: String,
    /// JSON body.
    pub body: Option<Value>,
}

/// Raw REST response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    /// Status code.
    pub status: u16,
    /// Body as text.
    pub body: String,
}

/// Raw HTTP access for kinds the typed client does not cover.
pub trait RestTransport: Send + Sync {
    /// Execute one request and return whatever status came back.
    fn execute(&self, request: RestRequest) -> PlatformFuture<'_, RestResponse>;
}

/// Name of a JSON object, if set.
pub fn object_name(object: &Value) -> Option<&str> {
    object.pointer("/metadata/name").and_then(Value::as_str)
}

/// Labels of a JSON object.
pub fn object_labels(object: &Value) -> Labels {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Whether `labels` contains every entry of `selector`.
pub fn labels_match(labels: &Labels, selector: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

/// Render a selector as `k=v,k2=v2`.
pub fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_matching() {
        let labels: Labels = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut selector = Labels::new();
        selector.insert("a".into(), "1".into());
        assert!(labels_match(&labels, &selector));

        selector.insert("b".into(), "3".into());
        assert!(!labels_match(&labels, &selector));
        assert_eq!(selector_string(&selector), "a=1,b=3");
    }

    #[test]
    fn reads_name_and_labels() {
        let object = json!({"metadata": {"name": "x", "labels": {"k": "v"}}});
        assert_eq!(object_name(&object), Some("x"));
        assert_eq!(object_labels(&object).get("k").map(String::as_str), Some("v"));
    }
}
