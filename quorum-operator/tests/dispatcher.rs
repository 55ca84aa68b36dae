//! Integration tests for coalesced reconciliation requests.

mod common;

use common::{NAMESPACE, assembly, setup, store_assembly};
use quorum_operator::controller::{ReconcileDispatcher, Reconciliation, Submission, Trigger};
use quorum_operator::platform::ResourceKind;
use std::sync::Arc;

fn started(submission: Submission) -> tokio::task::JoinHandle<()> {
    match submission {
        Submission::Started(handle) => handle,
        Submission::Coalesced => panic!("expected a new worker"),
    }
}

#[tokio::test]
async fn overlapping_triggers_restart_each_pod_once() {
    let (platform, _ctx, operator) = setup();
    let mut desired = assembly("prod", 3, 1);
    store_assembly(&platform, &desired);
    operator
        .reconcile(&Reconciliation::new(Trigger::Manual, NAMESPACE, "prod"))
        .await
        .unwrap();

    desired.spec.ensemble.image = Some("ensemble:2".to_string());
    store_assembly(&platform, &desired);
    platform.clear_mutations();

    let dispatcher = ReconcileDispatcher::new(Arc::new(operator), 4);
    let handle = started(dispatcher.submit(Reconciliation::new(Trigger::Watch, NAMESPACE, "prod")));
    let second = dispatcher.submit(Reconciliation::new(Trigger::Timer, NAMESPACE, "prod"));
    assert!(matches!(second, Submission::Coalesced));
    assert_eq!(dispatcher.in_flight(), 1);

    handle.await.unwrap();

    assert_eq!(
        platform.deleted_pods(),
        vec!["prod-ensemble-0", "prod-ensemble-1", "prod-ensemble-2"]
    );
    assert_eq!(platform.peak_unavailable(), 1);
    assert_eq!(dispatcher.in_flight(), 0);
    let images: Vec<_> = (0..3)
        .map(|ordinal| {
            platform
                .object(ResourceKind::Pod, NAMESPACE, &format!("prod-ensemble-{}", ordinal))
                .and_then(|pod| pod.pointer("/spec/containers/0/image").cloned())
                .unwrap()
        })
        .collect();
    assert!(images.iter().all(|image| image == "ensemble:2"), "{:?}", images);
}

#[tokio::test]
async fn different_assemblies_run_independently() {
    let (platform, _ctx, operator) = setup();
    store_assembly(&platform, &assembly("alpha", 1, 1));
    store_assembly(&platform, &assembly("beta", 1, 1));

    let dispatcher = ReconcileDispatcher::new(Arc::new(operator), 2);
    let alpha = started(dispatcher.submit(Reconciliation::new(Trigger::Watch, NAMESPACE, "alpha")));
    let beta = started(dispatcher.submit(Reconciliation::new(Trigger::Watch, NAMESPACE, "beta")));
    assert_eq!(dispatcher.in_flight(), 2);

    alpha.await.unwrap();
    beta.await.unwrap();

    for name in ["alpha-ensemble", "alpha-cluster", "beta-ensemble", "beta-cluster"] {
        assert!(platform.contains(ResourceKind::StatefulSet, NAMESPACE, name), "{}", name);
    }
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn request_after_completion_starts_a_new_worker() {
    let (platform, _ctx, operator) = setup();
    store_assembly(&platform, &assembly("prod", 1, 1));
    let dispatcher = ReconcileDispatcher::new(Arc::new(operator), 1);

    started(dispatcher.submit(Reconciliation::new(Trigger::Timer, NAMESPACE, "prod")))
        .await
        .unwrap();
    platform.clear_mutations();
    started(dispatcher.submit(Reconciliation::new(Trigger::Timer, NAMESPACE, "prod")))
        .await
        .unwrap();

    assert!(platform.mutations().is_empty());
}
