//! Common test utilities for integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use quorum_operator::certs::{CertAndKey, CertManager};
use quorum_operator::config::OperatorConfig;
use quorum_operator::controller::{AssemblyOperator, ControllerContext};
use quorum_operator::crd::{QuorumAssembly, QuorumAssemblySpec, ReplicaSetSpec, StorageType};
use quorum_operator::error::OperatorResult;
use quorum_operator::operator::{ANNOTATION_GENERATION, StatefulSetOperator, TemplateHash};
use quorum_operator::platform::{Platform, ResourceKind};
use quorum_operator::platform::memory::InMemoryPlatform;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Namespace every test assembly lives in.
pub const NAMESPACE: &str = "kafka";

/// Readiness timeout used by the test operators.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Certificates made of predictable strings, counting how many were issued.
#[derive(Default)]
pub struct FakeCerts {
    pub issued: Mutex<u32>,
}

impl CertManager for FakeCerts {
    fn generate_ca(&self, common_name: &str) -> OperatorResult<CertAndKey> {
        *self.issued.lock() += 1;
        Ok(CertAndKey {
            cert_pem: format!("ca-cert:{}", common_name),
            key_pem: format!("ca-key:{}", common_name),
        })
    }

    fn generate_signed(
        &self,
        _ca: &CertAndKey,
        common_name: &str,
        _sans: &[String],
    ) -> OperatorResult<CertAndKey> {
        *self.issued.lock() += 1;
        Ok(CertAndKey {
            cert_pem: format!("cert:{}", common_name),
            key_pem: format!("key:{}", common_name),
        })
    }
}

/// Operator configuration with short timeouts.
pub fn test_config() -> OperatorConfig {
    OperatorConfig::default()
        .with_readiness_timeout(READINESS_TIMEOUT)
        .with_readiness_poll_interval(Duration::from_millis(1))
}

/// Assembly with the given replica counts and ephemeral storage.
pub fn assembly(name: &str, ensemble: i32, cluster: i32) -> QuorumAssembly {
    let mut assembly = QuorumAssembly::new(
        name,
        QuorumAssemblySpec {
            ensemble: ReplicaSetSpec {
                replicas: ensemble,
                ..Default::default()
            },
            cluster: ReplicaSetSpec {
                replicas: cluster,
                ..Default::default()
            },
            companion: None,
        },
    );
    assembly.metadata.namespace = Some(NAMESPACE.to_string());
    assembly
}

/// Switch both replica sets to persistent claims.
pub fn with_persistent_storage(mut assembly: QuorumAssembly, delete_claim: bool) -> QuorumAssembly {
    for spec in [&mut assembly.spec.ensemble, &mut assembly.spec.cluster] {
        spec.storage.storage_type = StorageType::PersistentClaim;
        spec.storage.size = Some("1Gi".to_string());
        spec.storage.delete_claim = delete_claim;
    }
    assembly
}

/// Store (or replace) the assembly custom resource.
pub fn store_assembly(platform: &InMemoryPlatform, assembly: &QuorumAssembly) {
    let existing_status = platform
        .object(ResourceKind::QuorumAssembly, NAMESPACE, &assembly.metadata.name.clone().unwrap())
        .and_then(|object| object.get("status").cloned());
    let mut object = serde_json::to_value(assembly).unwrap();
    if let Some(status) = existing_status {
        object["status"] = status;
    }
    platform.seed(ResourceKind::QuorumAssembly, NAMESPACE, object);
}

/// Remove the assembly custom resource, as a user deleting it would.
pub async fn remove_assembly(platform: &InMemoryPlatform, name: &str) {
    let removed = platform
        .delete(ResourceKind::QuorumAssembly, NAMESPACE, name)
        .await
        .unwrap();
    assert!(removed, "assembly {} not stored", name);
}

/// Platform, context and assembly operator wired together.
pub fn setup() -> (Arc<InMemoryPlatform>, Arc<ControllerContext>, AssemblyOperator) {
    let platform = Arc::new(InMemoryPlatform::new());
    let ctx = Arc::new(ControllerContext::new(
        platform.clone(),
        platform.clone(),
        Arc::new(FakeCerts::default()),
        test_config(),
    ));
    let operator = AssemblyOperator::new(ctx.clone());
    (platform, ctx, operator)
}

/// StatefulSet operator using template hashes and short timeouts.
pub fn stateful_set_operator(platform: Arc<InMemoryPlatform>) -> StatefulSetOperator {
    StatefulSetOperator::new(
        platform,
        Arc::new(TemplateHash),
        READINESS_TIMEOUT,
        Duration::from_millis(1),
    )
}

fn selector(name: &str) -> Value {
    json!({ "app": name })
}

/// Store a StatefulSet whose template carries `current`, plus one Ready pod
/// per entry of `tokens` carrying that token. An empty token leaves the pod
/// without one.
pub fn seed_rolling(platform: &InMemoryPlatform, name: &str, current: &str, tokens: &[&str]) {
    let sts = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": { "name": name },
        "spec": {
            "replicas": tokens.len(),
            "serviceName": name,
            "selector": { "matchLabels": selector(name) },
            "updateStrategy": { "type": "OnDelete" },
            "template": {
                "metadata": {
                    "labels": selector(name),
                    "annotations": { ANNOTATION_GENERATION: current }
                },
                "spec": { "containers": [{ "name": "server", "image": "server:1" }] }
            }
        }
    });
    platform.seed(ResourceKind::StatefulSet, NAMESPACE, sts);
    let sts_uid = platform
        .object(ResourceKind::StatefulSet, NAMESPACE, name)
        .and_then(|sts| sts.pointer("/metadata/uid").cloned())
        .unwrap();

    for (ordinal, token) in tokens.iter().enumerate() {
        let annotations = if token.is_empty() {
            json!({})
        } else {
            json!({ ANNOTATION_GENERATION: token })
        };
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": format!("{}-{}", name, ordinal),
                "labels": selector(name),
                "annotations": annotations,
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "StatefulSet",
                    "name": name,
                    "uid": sts_uid,
                    "controller": true
                }]
            },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        });
        platform.seed(ResourceKind::Pod, NAMESPACE, pod);
    }
}

/// Generation token currently recorded on a pod.
pub fn pod_token(platform: &InMemoryPlatform, pod: &str) -> Option<String> {
    platform
        .object(ResourceKind::Pod, NAMESPACE, pod)?
        .pointer(&format!(
            "/metadata/annotations/{}",
            ANNOTATION_GENERATION.replace('/', "~1")
        ))?
        .as_str()
        .map(String::from)
}
