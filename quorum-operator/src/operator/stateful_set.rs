//! StatefulSet operator with ordered rolling restarts.
//!
//! Converging the StatefulSet object only changes its pod template. With the
//! `OnDelete` update strategy the platform then leaves running pods alone, so
//! after the converge step this operator walks the pods itself:
//!
//! 1. Read the StatefulSet's generation token from its pod template
//! 2. For each existing pod below `replicas`, lowest ordinal first, compare
//!    the pod's token
//! 3. Delete a stale pod and wait until its replacement carries the current
//!    token and reports Ready before looking at the next ordinal
//!
//! Progress lives only in the annotations, so an interrupted roll resumes at
//! the first stale ordinal on the next pass.

use super::generation::{
    ANNOTATION_GENERATION, ANNOTATION_TEMPLATE_HASH, GenerationStrategy, pod_token, template_hash,
    template_token,
};
use super::{Converge, ReconcileResult, ResourceOperator};
use crate::config::OperatorConfig;
use crate::error::{OperatorError, OperatorResult};
use crate::platform::{Labels, Platform, PlatformFuture, ResourceKind};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;

/// StatefulSet annotation recording whether claims go with the assembly.
pub const ANNOTATION_DELETE_CLAIM: &str = "quorum.io/delete-claim";

/// Pods visited by one rolling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollingUpdateReport {
    /// Ordinals that were deleted and came back current, in restart order.
    pub restarted: Vec<i32>,
    /// Ordinals that already carried the current token.
    pub current: Vec<i32>,
}

impl RollingUpdateReport {
    /// Whether the pass restarted nothing.
    pub fn is_noop(&self) -> bool {
        self.restarted.is_empty()
    }
}

/// Converge for StatefulSets plus the pod-by-pod restart loop.
#[derive(Clone)]
pub struct StatefulSetOperator {
    platform: Arc<dyn Platform>,
    stateful_sets: ResourceOperator<StatefulSet>,
    pods: ResourceOperator<Pod>,
    strategy: Arc<dyn GenerationStrategy>,
    readiness_timeout: Duration,
    poll_interval: Duration,
}

impl StatefulSetOperator {
    /// Create an operator.
    pub fn new(
        platform: Arc<dyn Platform>,
        strategy: Arc<dyn GenerationStrategy>,
        readiness_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stateful_sets: ResourceOperator::new(platform.clone()),
            pods: ResourceOperator::new(platform.clone()),
            platform,
            strategy,
            readiness_timeout,
            poll_interval,
        }
    }

    /// Create an operator using the configured strategy and timeouts.
    pub fn from_config(platform: Arc<dyn Platform>, config: &OperatorConfig) -> Self {
        Self::new(
            platform,
            super::strategy_for(config.generation_strategy()),
            config.readiness_timeout(),
            config.readiness_poll_interval(),
        )
    }

    /// Read one StatefulSet.
    pub async fn get(&self, namespace: &str, name: &str) -> OperatorResult<Option<StatefulSet>> {
        self.stateful_sets.get(namespace, name).await
    }

    /// List StatefulSets carrying all of `selector`'s labels.
    pub async fn list(
        &self,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> OperatorResult<Vec<StatefulSet>> {
        self.stateful_sets.list(namespace, selector).await
    }

    /// Stamp the generation token and template hash, and force the `OnDelete`
    /// update strategy.
    pub fn prepare(
        &self,
        mut desired: StatefulSet,
        live: Option<&StatefulSet>,
    ) -> OperatorResult<StatefulSet> {
        let spec = desired.spec.get_or_insert_with(Default::default);
        spec.update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("OnDelete".to_string()),
            rolling_update: None,
        });

        let token = self.strategy.token(&spec.template, live)?;
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_GENERATION.to_string(), token);

        let hash = template_hash(&spec.template)?;
        desired
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_TEMPLATE_HASH.to_string(), hash);
        Ok(desired)
    }

    /// Converge the StatefulSet, then restart stale pods in ordinal order.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        desired: Option<StatefulSet>,
    ) -> OperatorResult<ReconcileResult> {
        let Some(desired) = desired else {
            return self.stateful_sets.reconcile(namespace, name, None).await;
        };

        let live = self.stateful_sets.get(namespace, name).await?;
        let desired = self.prepare(desired, live.as_ref())?;
        let result = self
            .stateful_sets
            .reconcile(namespace, name, Some(&desired))
            .await?;

        let report = self.roll_stale_pods(namespace, name).await?;
        if !report.is_noop() {
            tracing::info!(
                namespace = %namespace,
                name = %name,
                restarted = ?report.restarted,
                strategy = self.strategy.name(),
                "Rolling update complete"
            );
        }
        Ok(result)
    }

    /// Restart every existing pod whose token differs from the StatefulSet's.
    ///
    /// Pods missing from the set (scale-up in progress) and pods at or beyond
    /// `replicas` (scale-down in progress) are left to the platform. A pod
    /// with no token counts as stale.
    pub async fn roll_stale_pods(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<RollingUpdateReport> {
        let sts = self
            .stateful_sets
            .get(namespace, name)
            .await?
            .ok_or_else(|| OperatorError::NotFound {
                kind: ResourceKind::StatefulSet.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;

        let spec = sts.spec.as_ref();
        let token = spec
            .and_then(|s| template_token(&s.template))
            .ok_or_else(|| OperatorError::MissingGeneration {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?
            .to_string();

        let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
        let selector: Labels = spec
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        let mut pods: Vec<(i32, Pod)> = self
            .pods
            .list(Some(namespace), &selector)
            .await?
            .into_iter()
            .filter_map(|pod| {
                let ordinal = pod
                    .metadata
                    .name
                    .as_deref()
                    .and_then(|pod_name| ordinal_of(name, pod_name))?;
                Some((ordinal, pod))
            })
            .collect();
        pods.sort_by_key(|(ordinal, _)| *ordinal);

        let mut report = RollingUpdateReport::default();
        for (ordinal, pod) in pods {
            let pod_name = format!("{}-{}", name, ordinal);
            if ordinal >= replicas {
                tracing::debug!(namespace = %namespace, pod = %pod_name, replicas, "Skipping pod beyond replicas");
                continue;
            }
            let recorded = pod_token(&pod);
            if recorded == Some(token.as_str()) {
                report.current.push(ordinal);
                continue;
            }

            tracing::info!(
                namespace = %namespace,
                pod = %pod_name,
                from = recorded.unwrap_or("<none>"),
                generation = %token,
                "Restarting stale pod"
            );
            let old_uid = pod.metadata.uid.clone();
            let deleted = self
                .platform
                .delete(ResourceKind::Pod, namespace, &pod_name)
                .await?;
            if !deleted {
                tracing::debug!(namespace = %namespace, pod = %pod_name, "Pod already gone");
            }
            self.await_replacement(namespace, &pod_name, old_uid.as_deref(), &token)
                .await?;
            report.restarted.push(ordinal);
        }

        Ok(report)
    }

    async fn await_replacement(
        &self,
        namespace: &str,
        pod_name: &str,
        old_uid: Option<&str>,
        token: &str,
    ) -> OperatorResult<()> {
        let wait = async {
            loop {
                if let Some(pod) = self.pods.get(namespace, pod_name).await? {
                    let replaced = pod.metadata.uid.as_deref() != old_uid;
                    if replaced && pod_token(&pod) == Some(token) && is_ready(&pod) {
                        tracing::debug!(namespace = %namespace, pod = %pod_name, "Pod is ready");
                        return Ok::<(), OperatorError>(());
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.readiness_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(OperatorError::ReadinessTimeout {
                namespace: namespace.to_string(),
                pod: pod_name.to_string(),
                timeout: self.readiness_timeout,
            }),
        }
    }
}

impl Converge<StatefulSet> for StatefulSetOperator {
    fn converge<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        desired: Option<StatefulSet>,
    ) -> PlatformFuture<'a, ReconcileResult> {
        Box::pin(self.reconcile(namespace, name, desired))
    }
}

/// Ordinal of `pod` if it belongs to the StatefulSet `name`.
pub(crate) fn ordinal_of(name: &str, pod: &str) -> Option<i32> {
    pod.strip_prefix(name)?.strip_prefix('-')?.parse().ok()
}

/// Whether the pod's Ready condition is True.
pub(crate) fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_parse_only_for_own_pods() {
        assert_eq!(ordinal_of("web", "web-3"), Some(3));
        assert_eq!(ordinal_of("web", "web-canary-0"), None);
        assert_eq!(ordinal_of("web", "webx-1"), None);
        assert_eq!(ordinal_of("web", "web"), None);
    }
}
