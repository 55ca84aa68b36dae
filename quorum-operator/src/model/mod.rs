//! Desired-state rendering.
//!
//! Turns a [`QuorumAssembly`](crate::crd::QuorumAssembly) into the concrete
//! objects the operators converge. Rendering is deterministic: the same spec
//! always yields the same objects, so re-rendering a converged assembly
//! applies as a no-op.

mod companion;
mod replica_set;
mod secrets;

pub use companion::CompanionModel;
pub use replica_set::{
    CLUSTER_CLIENT_PORT, CLUSTER_REPLICATION_PORT, DATA_VOLUME, ENSEMBLE_CLIENT_PORT,
    ENSEMBLE_ELECTION_PORT, ENSEMBLE_PEER_PORT, METRICS_PORT, ReplicaSetModel, claim_name,
};
pub use secrets::{CERT_KEY, KEY_KEY, SecretsModel};

use crate::platform::Labels;
use std::fmt;

/// Label naming the owning assembly.
pub const LABEL_ASSEMBLY: &str = "quorum.io/assembly";
/// Label naming the owning custom resource kind.
pub const LABEL_KIND: &str = "quorum.io/kind";
/// Label naming the component inside the assembly.
pub const LABEL_COMPONENT: &str = "quorum.io/component";
/// Standard managed-by label.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label.
pub const MANAGER: &str = "quorum-operator";

/// Part of an assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// Coordination ensemble.
    Ensemble,
    /// Data-plane cluster.
    Cluster,
    /// Companion controller.
    Companion,
}

impl Component {
    /// Label value and name suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Ensemble => "ensemble",
            Component::Cluster => "cluster",
            Component::Companion => "companion",
        }
    }

    /// `<assembly>-<component>`: StatefulSet, client Service or Deployment.
    pub fn resource_name(&self, assembly: &str) -> String {
        format!("{}-{}", assembly, self.as_str())
    }

    /// `<assembly>-<component>-headless`.
    pub fn headless_name(&self, assembly: &str) -> String {
        format!("{}-{}-headless", assembly, self.as_str())
    }

    /// `<assembly>-<component>-config`.
    pub fn config_name(&self, assembly: &str) -> String {
        format!("{}-{}-config", assembly, self.as_str())
    }

    /// `<assembly>-<component>-certs`.
    pub fn certs_name(&self, assembly: &str) -> String {
        format!("{}-{}-certs", assembly, self.as_str())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<assembly>-cluster-ca`.
pub fn cluster_ca_name(assembly: &str) -> String {
    format!("{}-cluster-ca", assembly)
}

/// Labels shared by everything an assembly owns.
pub fn assembly_labels(assembly: &str) -> Labels {
    Labels::from([
        (LABEL_ASSEMBLY.to_string(), assembly.to_string()),
        (LABEL_KIND.to_string(), "QuorumAssembly".to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
    ])
}

/// Assembly labels plus the component label.
pub fn component_labels(assembly: &str, component: Component) -> Labels {
    let mut labels = assembly_labels(assembly);
    labels.insert(LABEL_COMPONENT.to_string(), component.as_str().to_string());
    labels
}

/// Pod selector for one component.
pub fn selector_labels(assembly: &str, component: Component) -> Labels {
    Labels::from([
        (LABEL_ASSEMBLY.to_string(), assembly.to_string()),
        (LABEL_COMPONENT.to_string(), component.as_str().to_string()),
    ])
}

/// Selector matching every object an assembly owns, whichever assembly.
pub fn managed_selector() -> Labels {
    Labels::from([
        (LABEL_KIND.to_string(), "QuorumAssembly".to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::labels_match;

    #[test]
    fn names_follow_component() {
        assert_eq!(Component::Ensemble.resource_name("a"), "a-ensemble");
        assert_eq!(Component::Cluster.headless_name("a"), "a-cluster-headless");
        assert_eq!(Component::Ensemble.config_name("a"), "a-ensemble-config");
        assert_eq!(Component::Cluster.certs_name("a"), "a-cluster-certs");
        assert_eq!(cluster_ca_name("a"), "a-cluster-ca");
    }

    #[test]
    fn component_labels_match_selectors() {
        let labels = component_labels("a", Component::Cluster);
        assert!(labels_match(&labels, &selector_labels("a", Component::Cluster)));
        assert!(labels_match(&labels, &managed_selector()));
        assert!(!labels_match(&labels, &selector_labels("a", Component::Ensemble)));
    }
}
