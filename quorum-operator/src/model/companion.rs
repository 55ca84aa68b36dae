//! Rendering for the companion controller.

use super::replica_set::{CLUSTER_CLIENT_PORT, ENSEMBLE_CLIENT_PORT, container_resources};
use super::{Component, component_labels, selector_labels};
use crate::crd::{CompanionSpec, QuorumAssembly};
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde_json::{Value, json};

/// ClusterRole the companion is bound to.
pub const COMPANION_CLUSTER_ROLE: &str = "quorum-companion";

/// Rendered companion Deployment and its ClusterRoleBinding.
#[derive(Debug, Clone)]
pub struct CompanionModel {
    assembly: String,
    namespace: String,
    spec: CompanionSpec,
}

impl CompanionModel {
    /// Model for the assembly's companion, `None` when none is configured.
    pub fn from_assembly(assembly: &QuorumAssembly) -> OperatorResult<Option<Self>> {
        let Some(spec) = assembly.spec.companion.clone() else {
            return Ok(None);
        };
        let namespace = assembly
            .namespace()
            .ok_or_else(|| OperatorError::InvalidSpec("QuorumAssembly must be namespaced".into()))?;
        if spec.image.is_empty() {
            return Err(OperatorError::InvalidSpec(
                "companion image must not be empty".into(),
            ));
        }

        Ok(Some(Self {
            assembly: assembly.name_any(),
            namespace,
            spec,
        }))
    }

    /// Deployment name, `<assembly>-companion`.
    pub fn name(assembly: &str) -> String {
        Component::Companion.resource_name(assembly)
    }

    /// ClusterRoleBinding name. Cluster scoped, so it carries the namespace.
    pub fn binding_name(namespace: &str, assembly: &str) -> String {
        format!("quorum-companion-{}-{}", namespace, assembly)
    }

    /// Companion Deployment.
    pub fn deployment(&self) -> Deployment {
        let labels = component_labels(&self.assembly, Component::Companion);
        let watched = self
            .spec
            .watched_namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());

        let env = [
            ("QUORUM_ASSEMBLY", self.assembly.clone()),
            ("QUORUM_WATCHED_NAMESPACE", watched),
            (
                "QUORUM_RECONCILE_INTERVAL_MS",
                (i64::from(self.spec.reconcile_interval_seconds) * 1000).to_string(),
            ),
            (
                "QUORUM_ENSEMBLE_CONNECT",
                format!(
                    "{}:{}",
                    Component::Ensemble.resource_name(&self.assembly),
                    ENSEMBLE_CLIENT_PORT
                ),
            ),
            (
                "QUORUM_CLUSTER_BOOTSTRAP",
                format!(
                    "{}:{}",
                    Component::Cluster.resource_name(&self.assembly),
                    CLUSTER_CLIENT_PORT
                ),
            ),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

        Deployment {
            metadata: ObjectMeta {
                name: Some(Self::name(&self.assembly)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(selector_labels(&self.assembly, Component::Companion)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: Component::Companion.as_str().to_string(),
                            image: Some(self.spec.image.clone()),
                            env: Some(env),
                            resources: container_resources(&self.spec.resources),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// ClusterRoleBinding granting the namespace's default service account
    /// the companion ClusterRole.
    pub fn cluster_role_binding(&self) -> Value {
        json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {
                "name": Self::binding_name(&self.namespace, &self.assembly),
                "labels": component_labels(&self.assembly, Component::Companion)
            },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": COMPANION_CLUSTER_ROLE
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": "default",
                "namespace": self.namespace
            }]
        })
    }
}
