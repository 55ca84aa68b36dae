//! Quorum Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that runs a coordination
//! ensemble and a data-plane cluster as one unit, a *quorum assembly*, and
//! keeps it converged: certificates, services, configuration, storage,
//! StatefulSets and an optional companion controller.
//!
//! Pod template changes never roll pods all at once. StatefulSets run with
//! the `OnDelete` strategy and the operator restarts one pod at a time, lowest
//! ordinal first, waiting for each replacement to become ready.
//!
//! # Custom Resource Definitions
//!
//! - **QuorumAssembly**: an ensemble, a cluster and an optional companion
//!
//! # Example
//!
//! ```yaml
//! apiVersion: quorum.io/v1
//! kind: QuorumAssembly
//! metadata:
//!   name: production
//! spec:
//!   ensemble:
//!     replicas: 3
//!     storage:
//!       type: persistent-claim
//!       size: 10Gi
//!       deleteClaim: true
//!   cluster:
//!     replicas: 5
//!   companion:
//!     image: ghcr.io/quorum-io/companion:latest
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod certs;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod model;
pub mod observability;
pub mod operator;
pub mod platform;

pub use config::OperatorConfig;
pub use controller::{AssemblyOperator, ReconcileDispatcher, Reconciliation, Trigger};
pub use crd::{QuorumAssembly, QuorumAssemblySpec};
pub use error::{OperatorError, OperatorResult};
