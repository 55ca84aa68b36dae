//! Rendering for the certificate Secrets.
//!
//! Three Secrets per assembly: the cluster CA, and one per replica set holding
//! a certificate and key for each ordinal plus the CA certificate. Anything
//! already stored is reused, so rendering an unchanged assembly twice gives
//! the same Secrets and the converge step is a no-op.

use super::{Component, ReplicaSetModel, assembly_labels, cluster_ca_name, component_labels};
use crate::certs::{CertAndKey, CertManager};
use crate::error::OperatorResult;
use crate::platform::Labels;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Key of the CA certificate in every Secret.
pub const CERT_KEY: &str = "ca.crt";
/// Key of the CA private key in the CA Secret.
pub const KEY_KEY: &str = "ca.key";

#[derive(Debug, Clone)]
struct NodeSet {
    component: Component,
    stateful_set: String,
    headless: String,
    replicas: i32,
}

/// Desired certificate Secrets for one assembly.
#[derive(Debug, Clone)]
pub struct SecretsModel {
    assembly: String,
    namespace: String,
    nodes: Vec<NodeSet>,
}

impl SecretsModel {
    /// Model covering the given replica sets.
    pub fn new(assembly: &str, replica_sets: &[&ReplicaSetModel]) -> Self {
        let namespace = replica_sets
            .first()
            .map(|m| m.namespace().to_string())
            .unwrap_or_default();
        let nodes = replica_sets
            .iter()
            .map(|m| NodeSet {
                component: m.component(),
                stateful_set: m.name(),
                headless: m.headless_name(),
                replicas: m.replicas(),
            })
            .collect();

        Self {
            assembly: assembly.to_string(),
            namespace,
            nodes,
        }
    }

    /// Every Secret name an assembly owns, CA first.
    pub fn names(assembly: &str) -> Vec<String> {
        vec![
            cluster_ca_name(assembly),
            Component::Ensemble.certs_name(assembly),
            Component::Cluster.certs_name(assembly),
        ]
    }

    /// Render the Secrets, reusing whatever `existing` already holds.
    pub fn render(&self, existing: &[Secret], certs: &dyn CertManager) -> OperatorResult<Vec<Secret>> {
        let ca_name = cluster_ca_name(&self.assembly);
        let stored_ca = find(existing, &ca_name).and_then(|s| {
            Some(CertAndKey {
                cert_pem: entry(s, CERT_KEY)?,
                key_pem: entry(s, KEY_KEY)?,
            })
        });
        let reuse = stored_ca.is_some();
        let ca = match stored_ca {
            Some(ca) => ca,
            None => {
                tracing::info!(namespace = %self.namespace, name = %ca_name, "Generating cluster CA");
                certs.generate_ca(&ca_name)?
            }
        };

        let mut secrets = vec![self.secret(
            ca_name,
            assembly_labels(&self.assembly),
            BTreeMap::from([
                (CERT_KEY.to_string(), ca.cert_pem.clone()),
                (KEY_KEY.to_string(), ca.key_pem.clone()),
            ]),
        )];

        for nodes in &self.nodes {
            let name = nodes.component.certs_name(&self.assembly);
            let stored = find(existing, &name).filter(|_| reuse);

            let mut data = BTreeMap::from([(CERT_KEY.to_string(), ca.cert_pem.clone())]);
            for ordinal in 0..nodes.replicas {
                let pod = format!("{}-{}", nodes.stateful_set, ordinal);
                let cert_key = format!("{}.crt", pod);
                let key_key = format!("{}.key", pod);

                let pair = stored.and_then(|s| Some((entry(s, &cert_key)?, entry(s, &key_key)?)));
                let (cert_pem, key_pem) = match pair {
                    Some(pair) => pair,
                    None => {
                        let sans = self.sans(nodes, &pod);
                        let leaf = certs.generate_signed(&ca, &pod, &sans)?;
                        (leaf.cert_pem, leaf.key_pem)
                    }
                };
                data.insert(cert_key, cert_pem);
                data.insert(key_key, key_pem);
            }
            secrets.push(self.secret(
                name,
                component_labels(&self.assembly, nodes.component),
                data,
            ));
        }

        Ok(secrets)
    }

    fn sans(&self, nodes: &NodeSet, pod: &str) -> Vec<String> {
        vec![
            format!("{}.{}.{}.svc", pod, nodes.headless, self.namespace),
            format!("{}.{}.{}.svc.cluster.local", pod, nodes.headless, self.namespace),
            format!("{}.{}.svc", nodes.stateful_set, self.namespace),
            nodes.stateful_set.clone(),
        ]
    }

    fn secret(&self, name: String, labels: Labels, data: BTreeMap<String, String>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

fn find<'a>(secrets: &'a [Secret], name: &str) -> Option<&'a Secret> {
    secrets
        .iter()
        .find(|s| s.metadata.name.as_deref() == Some(name))
}

fn entry(secret: &Secret, key: &str) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}
