//! Assembly reconciliation.
//!
//! - [`AssemblyOperator`]: converges one assembly, or tears it down once the
//!   custom resource is gone
//! - [`ReconcileDispatcher`]: runs reconciliations on a bounded pool with at
//!   most one in flight per assembly
//! - [`Sweeper`]: periodic full reconciliation of every known assembly
//!
//! # Usage
//!
//! ```ignore
//! let ctx = Arc::new(ControllerContext::new(platform, transport, certs, config));
//! let operator = Arc::new(AssemblyOperator::new(ctx.clone()));
//! let dispatcher = ReconcileDispatcher::new(operator, ctx.config.max_concurrent_reconciles());
//!
//! dispatcher.submit(Reconciliation::new(Trigger::Watch, "kafka", "my-assembly"));
//! Sweeper::new(ctx.clone(), dispatcher.clone()).run().await;
//! ```

mod assembly;
mod dispatcher;
mod status;
mod trigger;

pub use assembly::AssemblyOperator;
pub use dispatcher::{ReconcileDispatcher, Submission};
pub use trigger::{Sweeper, watch_assemblies, watch_stateful_sets};

use crate::certs::CertManager;
use crate::config::OperatorConfig;
use crate::platform::{Platform, PlatformFuture, RestTransport};
use std::fmt;
use std::sync::Arc;

/// Shared context for controllers.
pub struct ControllerContext {
    /// Object store.
    pub platform: Arc<dyn Platform>,
    /// Raw REST access for the workaround client.
    pub transport: Arc<dyn RestTransport>,
    /// Certificate issuer.
    pub certs: Arc<dyn CertManager>,
    /// Operator configuration.
    pub config: OperatorConfig,
}

impl ControllerContext {
    /// Create a new controller context.
    pub fn new(
        platform: Arc<dyn Platform>,
        transport: Arc<dyn RestTransport>,
        certs: Arc<dyn CertManager>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            platform,
            transport,
            certs,
            config,
        }
    }
}

/// What caused a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic sweep.
    Timer,
    /// Watch event on an assembly or a managed object.
    Watch,
    /// Explicit request.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Timer => "timer",
            Trigger::Watch => "watch",
            Trigger::Manual => "manual",
        })
    }
}

/// Kind of assembly a reconciliation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssemblyType {
    /// [`QuorumAssembly`](crate::crd::QuorumAssembly).
    Quorum,
}

impl fmt::Display for AssemblyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssemblyType::Quorum => "QuorumAssembly",
        })
    }
}

/// Identity of one assembly. At most one reconciliation per key runs at once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssemblyKey {
    /// Assembly type.
    pub assembly_type: AssemblyType,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

/// One unit of reconciliation work. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// What caused it.
    pub trigger: Trigger,
    /// Assembly type.
    pub assembly_type: AssemblyType,
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl Reconciliation {
    /// Request for a [`QuorumAssembly`](crate::crd::QuorumAssembly).
    pub fn new(trigger: Trigger, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            trigger,
            assembly_type: AssemblyType::Quorum,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity used for mutual exclusion.
    pub fn key(&self) -> AssemblyKey {
        AssemblyKey {
            assembly_type: self.assembly_type,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reconciliation({}, {}, {}, {})",
            self.trigger, self.assembly_type, self.namespace, self.name
        )
    }
}

/// How a reconciliation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The assembly exists and every step converged.
    Converged,
    /// The assembly is gone and so is everything it owned.
    Deleted,
}

/// Something that can run a [`Reconciliation`].
pub trait Reconciler: Send + Sync + 'static {
    /// Run one reconciliation to completion.
    fn reconcile<'a>(&'a self, request: &'a Reconciliation) -> PlatformFuture<'a, ReconcileOutcome>;
}
