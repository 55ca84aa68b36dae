//! Resource operators.
//!
//! Each operator converges one kind of platform object to a desired state:
//!
//! - [`ResourceOperator`]: generic server-side apply / delete for any
//!   [`ManagedResource`](crate::platform::ManagedResource)
//! - [`StatefulSetOperator`]: the same for StatefulSets, followed by an
//!   ordered restart of pods whose generation token is stale
//! - [`WorkaroundOperator`]: raw REST converge for kinds the typed client
//!   does not cover
//!
//! All three implement [`Converge`], so callers do not care which one sits
//! behind a given step.

mod generation;
mod resource;
mod stateful_set;
mod workaround;

pub use generation::{
    ANNOTATION_GENERATION, ANNOTATION_TEMPLATE_HASH, GenerationStrategy, TemplateCounter,
    TemplateHash, pod_token, strategy_for, template_hash, template_token,
};
pub use resource::ResourceOperator;
pub use stateful_set::{ANNOTATION_DELETE_CLAIM, RollingUpdateReport, StatefulSetOperator};
pub(crate) use stateful_set::is_ready;
pub use workaround::WorkaroundOperator;

use crate::platform::PlatformFuture;
use std::fmt;

/// What a converge call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Already in the desired state.
    Noop,
    /// The object did not exist and was created.
    Created,
    /// The object existed and was updated.
    Patched,
    /// The object existed and was deleted.
    Deleted,
}

impl ReconcileResult {
    /// Whether the call changed anything.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ReconcileResult::Noop)
    }
}

impl fmt::Display for ReconcileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileResult::Noop => "noop",
            ReconcileResult::Created => "created",
            ReconcileResult::Patched => "patched",
            ReconcileResult::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Converge one named object to `desired`, or to absent when `desired` is
/// `None`.
///
/// Implementations must be idempotent: calling again with the same `desired`
/// returns [`ReconcileResult::Noop`] and mutates nothing. Cluster-scoped
/// implementations ignore `namespace`.
pub trait Converge<T>: Send + Sync {
    /// Run one converge step.
    fn converge<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        desired: Option<T>,
    ) -> PlatformFuture<'a, ReconcileResult>;
}
