//! Assembly status computation.

use crate::crd::{AssemblyCondition, QuorumAssemblyStatus, ReplicaStatus};
use crate::error::OperatorError;

/// Condition type reported on every assembly.
pub const CONDITION_READY: &str = "Ready";

/// Build the next status from the previous one and this pass's result.
///
/// `lastTransitionTime` is carried over unless the Ready status flips.
pub(crate) fn next_status(
    previous: &QuorumAssemblyStatus,
    observed_generation: Option<i64>,
    result: Result<(), &OperatorError>,
    ensemble: Option<ReplicaStatus>,
    cluster: Option<ReplicaStatus>,
    now: &str,
) -> QuorumAssemblyStatus {
    let (status, reason, message) = match result {
        Ok(()) => (
            "True",
            "Reconciled".to_string(),
            "Assembly converged".to_string(),
        ),
        Err(err) => ("False", err.reason().to_string(), err.to_string()),
    };

    let last_transition_time = previous
        .conditions
        .iter()
        .find(|c| c.condition_type == CONDITION_READY)
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());

    QuorumAssemblyStatus {
        observed_generation: observed_generation.or(previous.observed_generation),
        conditions: vec![AssemblyCondition {
            condition_type: CONDITION_READY.to_string(),
            status: status.to_string(),
            last_transition_time: Some(last_transition_time),
            reason: Some(reason),
            message: Some(message),
        }],
        ensemble: ensemble.or_else(|| previous.ensemble.clone()),
        cluster: cluster.or_else(|| previous.cluster.clone()),
    }
}
