//! Reconciliation dispatch.
//!
//! Requests run on a pool bounded by a semaphore. At most one request per
//! assembly is in flight; a request for an assembly that is already running
//! is folded into a single follow-up pass that starts once the current one
//! finishes, so however many triggers fire, the assembly sees at most one
//! running and one pending reconciliation.

use super::{AssemblyKey, Reconciler, Reconciliation};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// What [`ReconcileDispatcher::submit`] did with a request.
#[derive(Debug)]
pub enum Submission {
    /// Nothing was running for the assembly; a worker task was spawned.
    Started(JoinHandle<()>),
    /// A reconciliation is already running; this request becomes its
    /// follow-up pass, replacing any earlier pending one.
    Coalesced,
}

#[derive(Default)]
struct Slot {
    rerun: Option<Reconciliation>,
}

struct Inner {
    reconciler: Arc<dyn Reconciler>,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<AssemblyKey, Slot>>,
}

/// Bounded, per-assembly serialized executor for [`Reconciliation`]s.
#[derive(Clone)]
pub struct ReconcileDispatcher {
    inner: Arc<Inner>,
}

impl ReconcileDispatcher {
    /// Create a dispatcher running at most `max_concurrent` reconciliations.
    pub fn new(reconciler: Arc<dyn Reconciler>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit a request. Must be called from within a tokio runtime.
    pub fn submit(&self, request: Reconciliation) -> Submission {
        let key = request.key();
        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(slot) = in_flight.get_mut(&key) {
                tracing::debug!("{}: already in flight, coalescing", request);
                slot.rerun = Some(request);
                return Submission::Coalesced;
            }
            in_flight.insert(key.clone(), Slot::default());
        }

        let inner = self.inner.clone();
        Submission::Started(tokio::spawn(async move {
            inner.run(key, request).await;
        }))
    }

    /// Number of assemblies with a reconciliation running or pending.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }
}

// Releases the assembly's slot if the worker unwinds mid-pass.
struct SlotGuard<'a> {
    in_flight: &'a Mutex<HashMap<AssemblyKey, Slot>>,
    key: &'a AssemblyKey,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.lock().remove(self.key);
        }
    }
}

impl Inner {
    async fn run(&self, key: AssemblyKey, mut request: Reconciliation) {
        let mut guard = SlotGuard {
            in_flight: &self.in_flight,
            key: &key,
            armed: true,
        };
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!("{}: dispatcher closed, dropping request", request);
                    return;
                }
            };

            match self.reconciler.reconcile(&request).await {
                Ok(outcome) => {
                    tracing::debug!(outcome = ?outcome, "{}: finished", request);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "{}: failed, will retry on the next trigger", request);
                }
                Err(e) => {
                    tracing::error!(error = %e, reason = e.reason(), "{}: failed", request);
                }
            }
            drop(permit);

            let next = {
                let mut in_flight = self.in_flight.lock();
                let rerun = in_flight.get_mut(&key).and_then(|slot| slot.rerun.take());
                if rerun.is_none() {
                    in_flight.remove(&key);
                    guard.armed = false;
                }
                rerun
            };
            match next {
                Some(next) => request = next,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ReconcileOutcome, Trigger};
    use crate::error::OperatorError;
    use crate::platform::PlatformFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gated {
        gate: Semaphore,
        runs: Mutex<Vec<Reconciliation>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    fn gated(fail: bool) -> Arc<Gated> {
        Arc::new(Gated {
            gate: Semaphore::new(0),
            runs: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail,
        })
    }

    impl Reconciler for Gated {
        fn reconcile<'a>(
            &'a self,
            request: &'a Reconciliation,
        ) -> PlatformFuture<'a, ReconcileOutcome> {
            Box::pin(async move {
                self.runs.lock().push(request.clone());
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(active, Ordering::SeqCst);
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
                self.active.fetch_sub(1, Ordering::SeqCst);
                if self.fail {
                    return Err(OperatorError::InvalidSpec("broken".into()));
                }
                Ok(ReconcileOutcome::Converged)
            })
        }
    }

    struct PanicsOnce {
        calls: AtomicUsize,
    }

    impl Reconciler for PanicsOnce {
        fn reconcile<'a>(
            &'a self,
            _request: &'a Reconciliation,
        ) -> PlatformFuture<'a, ReconcileOutcome> {
            Box::pin(async move {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("reconciler bug");
                }
                Ok(ReconcileOutcome::Converged)
            })
        }
    }

    fn started(submission: Submission) -> JoinHandle<()> {
        match submission {
            Submission::Started(handle) => handle,
            Submission::Coalesced => panic!("expected a new worker"),
        }
    }

    #[tokio::test]
    async fn requests_for_a_running_assembly_coalesce_into_one_rerun() {
        let reconciler = gated(false);
        let dispatcher = ReconcileDispatcher::new(reconciler.clone(), 4);

        let handle = started(dispatcher.submit(Reconciliation::new(Trigger::Watch, "ns", "a")));
        for trigger in [Trigger::Timer, Trigger::Manual] {
            assert!(matches!(
                dispatcher.submit(Reconciliation::new(trigger, "ns", "a")),
                Submission::Coalesced
            ));
        }
        assert_eq!(dispatcher.in_flight(), 1);

        reconciler.gate.add_permits(2);
        handle.await.expect("worker");

        let runs = reconciler.runs.lock().clone();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].trigger, Trigger::Manual);
        assert_eq!(reconciler.peak.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_do_not_block_later_requests() {
        let reconciler = gated(true);
        reconciler.gate.add_permits(10);
        let dispatcher = ReconcileDispatcher::new(reconciler.clone(), 1);

        started(dispatcher.submit(Reconciliation::new(Trigger::Timer, "ns", "a")))
            .await
            .expect("worker");
        started(dispatcher.submit(Reconciliation::new(Trigger::Timer, "ns", "a")))
            .await
            .expect("worker");
        assert_eq!(reconciler.runs.lock().len(), 2);
    }

    #[tokio::test]
    async fn panicking_pass_releases_the_assembly() {
        let reconciler = Arc::new(PanicsOnce {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = ReconcileDispatcher::new(reconciler.clone(), 1);

        let crashed = started(dispatcher.submit(Reconciliation::new(Trigger::Watch, "ns", "a")))
            .await;
        assert!(crashed.is_err());
        assert_eq!(dispatcher.in_flight(), 0);

        started(dispatcher.submit(Reconciliation::new(Trigger::Timer, "ns", "a")))
            .await
            .expect("worker");
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
