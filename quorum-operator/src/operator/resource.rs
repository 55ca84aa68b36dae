//! Generic resource operator.

use super::{Converge, ReconcileResult};
use crate::error::OperatorResult;
use crate::platform::{Labels, ManagedResource, Platform, PlatformFuture};
use serde_json::{Value, json};
use std::marker::PhantomData;
use std::sync::Arc;

/// Idempotent converge for one resource kind.
pub struct ResourceOperator<K> {
    platform: Arc<dyn Platform>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for ResourceOperator<K> {
    fn clone(&self) -> Self {
        Self {
            platform: self.platform.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: ManagedResource> ResourceOperator<K> {
    /// Create an operator over a platform.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            _kind: PhantomData,
        }
    }

    /// Read one object.
    pub async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<K>> {
        self.platform
            .get(K::KIND, namespace, name)
            .await?
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .transpose()
    }

    /// List objects carrying all of `selector`'s labels.
    pub async fn list(&self, namespace: Option<&str>, selector: &Labels) -> OperatorResult<Vec<K>> {
        self.platform
            .list(K::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    /// Converge `namespace/name` to `desired`.
    ///
    /// - absent and `None`: nothing to do
    /// - present and `None`: delete
    /// - `Some`: server-side apply the full object, carrying the current
    ///   resource version; fields dropped from `desired` are removed, and an
    ///   apply that leaves the resource version unchanged counts as a noop
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        desired: Option<&K>,
    ) -> OperatorResult<ReconcileResult> {
        let kind = K::KIND;
        let current = self.platform.get(kind, namespace, name).await?;

        let result = match (current, desired) {
            (None, None) => ReconcileResult::Noop,
            (Some(_), None) => {
                tracing::info!(kind = %kind, namespace = %namespace, name = %name, "Deleting resource");
                if self.platform.delete(kind, namespace, name).await? {
                    ReconcileResult::Deleted
                } else {
                    ReconcileResult::Noop
                }
            }
            (current, Some(desired)) => {
                let mut object = desired_value(desired, namespace, name)?;
                let version = current
                    .as_ref()
                    .and_then(|c| c.pointer("/metadata/resourceVersion"))
                    .cloned();
                if let Some(version) = &version {
                    object["metadata"]["resourceVersion"] = version.clone();
                }
                tracing::debug!(kind = %kind, namespace = %namespace, name = %name, "Applying resource");
                let applied = self.platform.apply(kind, namespace, name, object).await?;

                match version {
                    None => {
                        tracing::info!(kind = %kind, namespace = %namespace, name = %name, "Created resource");
                        ReconcileResult::Created
                    }
                    Some(version) if applied.pointer("/metadata/resourceVersion") == Some(&version) => {
                        ReconcileResult::Noop
                    }
                    Some(_) => {
                        tracing::info!(kind = %kind, namespace = %namespace, name = %name, "Patched resource");
                        ReconcileResult::Patched
                    }
                }
            }
        };

        if !result.is_mutation() {
            tracing::debug!(kind = %kind, namespace = %namespace, name = %name, "Resource already converged");
        }
        Ok(result)
    }
}

fn desired_value<K: ManagedResource>(desired: &K, namespace: &str, name: &str) -> OperatorResult<Value> {
    let mut object = serde_json::to_value(desired)?;
    if !object.get("metadata").is_some_and(Value::is_object) {
        object["metadata"] = json!({});
    }
    let metadata = &mut object["metadata"];
    if metadata.get("name").is_none_or(Value::is_null) {
        metadata["name"] = json!(name);
    }
    if metadata.get("namespace").is_none_or(Value::is_null) {
        metadata["namespace"] = json!(namespace);
    }
    Ok(object)
}

impl<K: ManagedResource> Converge<K> for ResourceOperator<K> {
    fn converge<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        desired: Option<K>,
    ) -> PlatformFuture<'a, ReconcileResult> {
        Box::pin(async move { self.reconcile(namespace, name, desired.as_ref()).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{InMemoryPlatform, Verb};
    use crate::platform::ResourceKind;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("key".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    fn operator() -> (Arc<InMemoryPlatform>, ResourceOperator<ConfigMap>) {
        let platform = Arc::new(InMemoryPlatform::new());
        let operator = ResourceOperator::new(platform.clone());
        (platform, operator)
    }

    #[tokio::test]
    async fn create_then_noop() {
        let (platform, operator) = operator();
        let desired = config_map("a");

        let first = operator.reconcile("ns", "settings", Some(&desired)).await.expect("create");
        let second = operator.reconcile("ns", "settings", Some(&desired)).await.expect("noop");

        assert_eq!(first, ReconcileResult::Created);
        assert_eq!(second, ReconcileResult::Noop);
        assert_eq!(platform.mutations().len(), 1);
    }

    #[tokio::test]
    async fn changed_field_is_patched() {
        let (platform, operator) = operator();
        operator
            .reconcile("ns", "settings", Some(&config_map("a")))
            .await
            .expect("create");

        let result = operator
            .reconcile("ns", "settings", Some(&config_map("b")))
            .await
            .expect("patch");
        assert_eq!(result, ReconcileResult::Patched);

        let stored = operator.get("ns", "settings").await.expect("get").expect("exists");
        assert_eq!(
            stored.data.and_then(|d| d.get("key").cloned()).as_deref(),
            Some("b")
        );
        assert_eq!(platform.mutations()[1].verb, Verb::Patch);
    }

    #[tokio::test]
    async fn dropped_key_is_removed() {
        let (platform, operator) = operator();
        let mut desired = config_map("a");
        if let Some(data) = desired.data.as_mut() {
            data.insert("metrics.json".into(), "{}".into());
        }
        operator
            .reconcile("ns", "settings", Some(&desired))
            .await
            .expect("create");

        let result = operator
            .reconcile("ns", "settings", Some(&config_map("a")))
            .await
            .expect("apply");
        assert_eq!(result, ReconcileResult::Patched);

        let stored = operator.get("ns", "settings").await.expect("get").expect("exists");
        let keys: Vec<_> = stored.data.unwrap_or_default().into_keys().collect();
        assert_eq!(keys, vec!["key"]);
        assert_eq!(platform.mutations().len(), 2);
    }

    #[tokio::test]
    async fn absent_desired_deletes_once() {
        let (platform, operator) = operator();
        operator
            .reconcile("ns", "settings", Some(&config_map("a")))
            .await
            .expect("create");

        assert_eq!(
            operator.reconcile("ns", "settings", None).await.expect("delete"),
            ReconcileResult::Deleted
        );
        assert_eq!(
            operator.reconcile("ns", "settings", None).await.expect("noop"),
            ReconcileResult::Noop
        );
        assert!(!platform.contains(ResourceKind::ConfigMap, "ns", "settings"));
    }

    #[tokio::test]
    async fn missing_name_is_filled_in() {
        let (platform, operator) = operator();
        let mut desired = config_map("a");
        desired.metadata.name = None;

        operator
            .converge("ns", "settings", Some(desired))
            .await
            .expect("create");
        assert!(platform.contains(ResourceKind::ConfigMap, "ns", "settings"));
    }

    #[tokio::test]
    async fn platform_errors_propagate() {
        let (platform, operator) = operator();
        platform.fail(Verb::Create, ResourceKind::ConfigMap, None);

        let err = operator
            .reconcile("ns", "settings", Some(&config_map("a")))
            .await
            .expect_err("create fails");
        assert!(err.is_transient());
    }
}
