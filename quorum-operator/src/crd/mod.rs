//! Custom Resource Definitions for the quorum operator.
//!
//! - [`QuorumAssembly`]: an ensemble, a data-plane cluster and an optional companion

mod assembly;

pub use assembly::{
    AssemblyCondition, CompanionSpec, QuorumAssembly, QuorumAssemblySpec, QuorumAssemblyStatus,
    ReplicaSetSpec, ReplicaStatus, ResourceRequirements, ResourceSpec, StorageSpec, StorageType,
};
