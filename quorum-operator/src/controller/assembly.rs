//! QuorumAssembly controller.
//!
//! Converges everything an assembly owns in a fixed order:
//!
//! 1. Certificate Secrets
//! 2. Ensemble: headless Service, Service, ConfigMap, claims, StatefulSet
//! 3. Cluster: the same set of objects
//! 4. Companion: ClusterRoleBinding and Deployment, or their removal
//! 5. Status
//!
//! The first failing step ends the pass. Every step is idempotent, so the next
//! pass picks up from whatever is still out of date. Once the custom resource
//! is gone the same objects are removed in reverse order.

use super::status::next_status;
use super::{ControllerContext, ReconcileOutcome, Reconciler, Reconciliation};
use crate::crd::{QuorumAssembly, ReplicaStatus};
use crate::error::{OperatorError, OperatorResult};
use crate::model::{CompanionModel, Component, ReplicaSetModel, SecretsModel, selector_labels};
use crate::operator::{
    ANNOTATION_DELETE_CLAIM, ResourceOperator, StatefulSetOperator, WorkaroundOperator, is_ready,
};
use crate::platform::{PlatformFuture, ResourceKind};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::Instrument;

/// Controller for QuorumAssembly resources.
#[derive(Clone)]
pub struct AssemblyOperator {
    ctx: Arc<ControllerContext>,
    assemblies: ResourceOperator<QuorumAssembly>,
    secrets: ResourceOperator<Secret>,
    services: ResourceOperator<Service>,
    config_maps: ResourceOperator<ConfigMap>,
    claims: ResourceOperator<PersistentVolumeClaim>,
    stateful_sets: StatefulSetOperator,
    deployments: ResourceOperator<Deployment>,
    bindings: WorkaroundOperator,
    pods: ResourceOperator<Pod>,
}

impl AssemblyOperator {
    /// Create a new assembly controller.
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        let platform = ctx.platform.clone();
        Self {
            assemblies: ResourceOperator::new(platform.clone()),
            secrets: ResourceOperator::new(platform.clone()),
            services: ResourceOperator::new(platform.clone()),
            config_maps: ResourceOperator::new(platform.clone()),
            claims: ResourceOperator::new(platform.clone()),
            stateful_sets: StatefulSetOperator::from_config(platform.clone(), &ctx.config),
            deployments: ResourceOperator::new(platform.clone()),
            bindings: WorkaroundOperator::cluster_role_bindings(ctx.transport.clone()),
            pods: ResourceOperator::new(platform),
            ctx,
        }
    }

    /// Run one reconciliation.
    ///
    /// A missing assembly takes the deletion path. Otherwise the assembly is
    /// converged and its status updated whether or not that succeeded.
    pub async fn reconcile(&self, request: &Reconciliation) -> OperatorResult<ReconcileOutcome> {
        let span = tracing::info_span!(
            "reconcile",
            trigger = %request.trigger,
            namespace = %request.namespace,
            name = %request.name,
        );

        async move {
            tracing::info!("{}: reconciliation started", request);
            let namespace = request.namespace.as_str();
            let name = request.name.as_str();

            let Some(assembly) = self.assemblies.get(namespace, name).await? else {
                tracing::info!("Assembly not found, removing managed resources");
                self.delete(namespace, name).await?;
                tracing::info!("{}: assembly resources removed", request);
                return Ok(ReconcileOutcome::Deleted);
            };

            let result = self.create_or_update(&assembly).await;
            match &result {
                Ok(()) => tracing::info!("{}: reconciliation succeeded", request),
                Err(e) => tracing::warn!(error = %e, reason = e.reason(), "{}: reconciliation failed", request),
            }

            let status = self.update_status(&assembly, result.as_ref().err()).await;
            result?;
            status?;
            Ok(ReconcileOutcome::Converged)
        }
        .instrument(span)
        .await
    }

    async fn create_or_update(&self, assembly: &QuorumAssembly) -> OperatorResult<()> {
        let name = assembly.name_any();
        let namespace = assembly
            .namespace()
            .ok_or_else(|| OperatorError::InvalidSpec("QuorumAssembly must be namespaced".into()))?;

        let ensemble = ReplicaSetModel::ensemble(assembly)?;
        let cluster = ReplicaSetModel::cluster(assembly)?;
        let companion = CompanionModel::from_assembly(assembly)?;

        self.reconcile_secrets(&namespace, &name, &[&ensemble, &cluster])
            .await?;
        self.reconcile_replica_set(&ensemble).await?;
        self.reconcile_replica_set(&cluster).await?;
        self.reconcile_companion(&namespace, &name, companion.as_ref())
            .await?;
        Ok(())
    }

    async fn reconcile_secrets(
        &self,
        namespace: &str,
        name: &str,
        replica_sets: &[&ReplicaSetModel],
    ) -> OperatorResult<()> {
        let mut existing = Vec::new();
        for secret_name in SecretsModel::names(name) {
            if let Some(secret) = self.secrets.get(namespace, &secret_name).await? {
                existing.push(secret);
            }
        }

        let desired = SecretsModel::new(name, replica_sets).render(&existing, self.ctx.certs.as_ref())?;
        for secret in desired {
            let secret_name = secret.name_any();
            self.secrets
                .reconcile(namespace, &secret_name, Some(&secret))
                .await?;
        }
        Ok(())
    }

    async fn reconcile_replica_set(&self, model: &ReplicaSetModel) -> OperatorResult<()> {
        let namespace = model.namespace();
        tracing::debug!(component = %model.component(), "Reconciling replica set");

        self.services
            .reconcile(namespace, &model.headless_name(), Some(&model.headless_service()))
            .await?;
        self.services
            .reconcile(namespace, &model.name(), Some(&model.service()))
            .await?;
        self.config_maps
            .reconcile(namespace, &model.config_name(), Some(&model.config_map()))
            .await?;
        for claim in model.claims() {
            let claim_name = claim.name_any();
            self.claims
                .reconcile(namespace, &claim_name, Some(&claim))
                .await?;
        }
        self.stateful_sets
            .reconcile(namespace, &model.name(), Some(model.stateful_set()))
            .await?;
        Ok(())
    }

    async fn reconcile_companion(
        &self,
        namespace: &str,
        name: &str,
        companion: Option<&CompanionModel>,
    ) -> OperatorResult<()> {
        let deployment = CompanionModel::name(name);
        let binding = CompanionModel::binding_name(namespace, name);

        match companion {
            Some(model) => {
                self.bindings
                    .reconcile(&binding, Some(model.cluster_role_binding()))
                    .await?;
                self.deployments
                    .reconcile(namespace, &deployment, Some(&model.deployment()))
                    .await?;
            }
            None => {
                self.deployments.reconcile(namespace, &deployment, None).await?;
                self.bindings.reconcile(&binding, None).await?;
            }
        }
        Ok(())
    }

    async fn replica_status(
        &self,
        namespace: &str,
        name: &str,
        component: Component,
    ) -> OperatorResult<ReplicaStatus> {
        let pods = self
            .pods
            .list(Some(namespace), &selector_labels(name, component))
            .await?;
        Ok(ReplicaStatus {
            replicas: pods.len() as i32,
            ready_replicas: pods.iter().filter(|pod| is_ready(pod)).count() as i32,
        })
    }

    async fn update_status(
        &self,
        assembly: &QuorumAssembly,
        error: Option<&OperatorError>,
    ) -> OperatorResult<()> {
        let name = assembly.name_any();
        let Some(namespace) = assembly.namespace() else {
            return Ok(());
        };

        let mut counts = Vec::with_capacity(2);
        for component in [Component::Ensemble, Component::Cluster] {
            match self.replica_status(&namespace, &name, component).await {
                Ok(status) => counts.push(Some(status)),
                Err(e) => {
                    tracing::warn!(component = %component, error = %e, "Failed to count pods");
                    counts.push(None);
                }
            }
        }
        let cluster = counts.pop().flatten();
        let ensemble = counts.pop().flatten();

        let previous = assembly.status.clone().unwrap_or_default();
        let result = match error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        let next = next_status(
            &previous,
            assembly.metadata.generation,
            result,
            ensemble,
            cluster,
            &chrono::Utc::now().to_rfc3339(),
        );
        if next == previous {
            tracing::debug!("Status unchanged");
            return Ok(());
        }

        self.ctx
            .platform
            .patch_status(
                ResourceKind::QuorumAssembly,
                &namespace,
                &name,
                serde_json::to_value(&next)?,
            )
            .await
    }

    /// Remove everything the assembly owned, newest dependency first.
    async fn delete(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        let mut deleted: Vec<(ResourceKind, String)> = Vec::new();

        let deployment = CompanionModel::name(name);
        self.deployments.reconcile(namespace, &deployment, None).await?;
        deleted.push((ResourceKind::Deployment, deployment));

        let binding = CompanionModel::binding_name(namespace, name);
        self.bindings.reconcile(&binding, None).await?;

        for component in [Component::Cluster, Component::Ensemble] {
            let stateful_set = component.resource_name(name);
            let delete_claims = self
                .stateful_sets
                .get(namespace, &stateful_set)
                .await?
                .as_ref()
                .is_some_and(|sts: &StatefulSet| deletes_claims(sts));

            self.stateful_sets
                .reconcile(namespace, &stateful_set, None)
                .await?;
            deleted.push((ResourceKind::StatefulSet, stateful_set));

            let config_map = component.config_name(name);
            self.config_maps.reconcile(namespace, &config_map, None).await?;
            deleted.push((ResourceKind::ConfigMap, config_map));

            for service in [component.headless_name(name), component.resource_name(name)] {
                self.services.reconcile(namespace, &service, None).await?;
                deleted.push((ResourceKind::Service, service));
            }

            let claims = self
                .claims
                .list(Some(namespace), &selector_labels(name, component))
                .await?;
            for claim in claims {
                let claim_name = claim.name_any();
                if !delete_claims && !deletes_claims(&claim) {
                    tracing::info!(claim = %claim_name, "Keeping claim");
                    continue;
                }
                self.claims.reconcile(namespace, &claim_name, None).await?;
                deleted.push((ResourceKind::PersistentVolumeClaim, claim_name));
            }
        }

        for secret in SecretsModel::names(name) {
            self.secrets.reconcile(namespace, &secret, None).await?;
            deleted.push((ResourceKind::Secret, secret));
        }

        let mut remaining = 0;
        for (kind, object) in &deleted {
            if self.ctx.platform.get(*kind, namespace, object).await?.is_some() {
                tracing::debug!(kind = %kind, object = %object, "Still present");
                remaining += 1;
            }
        }
        if self.bindings.get(&binding).await?.is_some() {
            remaining += 1;
        }

        if remaining > 0 {
            return Err(OperatorError::DeletionPending {
                namespace: namespace.to_string(),
                name: name.to_string(),
                remaining,
            });
        }
        Ok(())
    }
}

/// Whether the object's delete-claim annotation is set.
fn deletes_claims<K: ResourceExt>(object: &K) -> bool {
    object
        .annotations()
        .get(ANNOTATION_DELETE_CLAIM)
        .is_some_and(|v| v == "true")
}

impl Reconciler for AssemblyOperator {
    fn reconcile<'a>(&'a self, request: &'a Reconciliation) -> PlatformFuture<'a, ReconcileOutcome> {
        Box::pin(AssemblyOperator::reconcile(self, request))
    }
}
