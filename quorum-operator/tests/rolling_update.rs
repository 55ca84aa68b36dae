//! Integration tests for ordered rolling restarts of StatefulSet pods.

mod common;

use common::{NAMESPACE, pod_token, seed_rolling, stateful_set_operator};
use k8s_openapi::api::apps::v1::StatefulSet;
use quorum_operator::error::OperatorError;
use quorum_operator::operator::{
    ANNOTATION_GENERATION, ReconcileResult, StatefulSetOperator, TemplateCounter,
};
use quorum_operator::platform::ResourceKind;
use quorum_operator::platform::memory::{InMemoryPlatform, Verb};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn pods(name: &str, ordinals: &[i32]) -> Vec<String> {
    ordinals.iter().map(|i| format!("{}-{}", name, i)).collect()
}

fn desired(name: &str, image: &str) -> StatefulSet {
    serde_json::from_value(json!({
        "metadata": { "name": name },
        "spec": {
            "replicas": 3,
            "serviceName": name,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": "server", "image": image }] }
            }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn stale_pods_restart_in_ascending_order() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3", "3", "2", "1", "1"]);
    let operator = stateful_set_operator(platform.clone());

    let report = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap();

    assert_eq!(report.restarted, vec![2, 3, 4]);
    assert_eq!(report.current, vec![0, 1]);
    assert_eq!(platform.deleted_pods(), pods("web", &[2, 3, 4]));
    for ordinal in 0..5 {
        assert_eq!(
            pod_token(&platform, &format!("web-{}", ordinal)).as_deref(),
            Some("3")
        );
    }
    assert_eq!(platform.peak_unavailable(), 1);
}

#[tokio::test]
async fn ensemble_with_descending_tokens_converges() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "ensemble", "3", &["3", "2", "1"]);
    let operator = stateful_set_operator(platform.clone());

    let report = operator.roll_stale_pods(NAMESPACE, "ensemble").await.unwrap();

    assert_eq!(report.restarted, vec![1, 2]);
    assert_eq!(platform.deleted_pods(), pods("ensemble", &[1, 2]));
    assert_eq!(pod_token(&platform, "ensemble-0").as_deref(), Some("3"));
}

#[tokio::test]
async fn interrupted_roll_resumes_at_first_stale_pod() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3", "1", "1", "1"]);
    platform.fail_once(Verb::Delete, ResourceKind::Pod, Some("web-2"));
    let operator = stateful_set_operator(platform.clone());

    let err = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap_err();
    assert!(matches!(err, OperatorError::Platform(_)));
    assert_eq!(platform.deleted_pods(), pods("web", &[1]));

    let report = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap();
    assert_eq!(report.restarted, vec![2, 3]);
    assert_eq!(report.current, vec![0, 1]);
    assert_eq!(platform.deleted_pods(), pods("web", &[1, 2, 3]));
}

#[tokio::test]
async fn converged_set_deletes_nothing() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "7", &["7", "7", "7"]);
    let operator = stateful_set_operator(platform.clone());

    let report = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap();

    assert!(report.is_noop());
    assert!(platform.deleted_pods().is_empty());
    assert!(platform.mutations().is_empty());
}

#[tokio::test]
async fn missing_pods_are_left_to_the_platform() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3", "2"]);
    platform.modify(ResourceKind::StatefulSet, NAMESPACE, "web", |sts| {
        sts["spec"]["replicas"] = json!(4);
    });
    let operator = stateful_set_operator(platform.clone());

    let report = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap();

    assert_eq!(report.restarted, vec![1]);
    assert_eq!(platform.deleted_pods(), pods("web", &[1]));
}

#[tokio::test]
async fn pods_beyond_replicas_are_left_to_scale_down() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3", "3", "1"]);
    platform.modify(ResourceKind::StatefulSet, NAMESPACE, "web", |sts| {
        sts["spec"]["replicas"] = json!(2);
    });
    let operator = stateful_set_operator(platform.clone());

    let report = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap();

    assert!(report.restarted.is_empty());
    assert_eq!(report.current, vec![0, 1]);
    assert!(platform.deleted_pods().is_empty());
    assert_eq!(pod_token(&platform, "web-2").as_deref(), Some("1"));
}

#[tokio::test]
async fn pod_without_token_counts_as_stale() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3", ""]);
    let operator = stateful_set_operator(platform.clone());

    let report = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap();

    assert_eq!(report.restarted, vec![1]);
    assert_eq!(pod_token(&platform, "web-1").as_deref(), Some("3"));
}

#[tokio::test]
async fn replacement_that_never_becomes_ready_times_out() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3", "2", "2"]);
    platform.set_recreated_pods_ready(false);
    let operator = StatefulSetOperator::new(
        platform.clone(),
        Arc::new(quorum_operator::operator::TemplateHash),
        Duration::from_millis(50),
        Duration::from_millis(1),
    );

    let err = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap_err();

    match err {
        OperatorError::ReadinessTimeout { pod, .. } => assert_eq!(pod, "web-1"),
        other => panic!("expected ReadinessTimeout, got {:?}", other),
    }
    assert_eq!(platform.deleted_pods(), pods("web", &[1]));
}

#[tokio::test]
async fn template_without_token_is_rejected() {
    let platform = Arc::new(InMemoryPlatform::new());
    seed_rolling(&platform, "web", "3", &["3"]);
    platform.modify(ResourceKind::StatefulSet, NAMESPACE, "web", |sts| {
        sts["spec"]["template"]["metadata"]["annotations"] = json!({});
    });
    let operator = stateful_set_operator(platform.clone());

    let err = operator.roll_stale_pods(NAMESPACE, "web").await.unwrap_err();
    assert!(matches!(err, OperatorError::MissingGeneration { .. }));
    assert!(platform.deleted_pods().is_empty());
}

#[tokio::test]
async fn template_change_rolls_every_pod_once() {
    let platform = Arc::new(InMemoryPlatform::new());
    let operator = stateful_set_operator(platform.clone());

    let created = operator
        .reconcile(NAMESPACE, "web", Some(desired("web", "server:1")))
        .await
        .unwrap();
    assert_eq!(created, ReconcileResult::Created);
    assert!(platform.deleted_pods().is_empty());

    let sts = platform
        .object(ResourceKind::StatefulSet, NAMESPACE, "web")
        .unwrap();
    assert_eq!(
        sts.pointer("/spec/updateStrategy/type").and_then(|v| v.as_str()),
        Some("OnDelete")
    );

    let patched = operator
        .reconcile(NAMESPACE, "web", Some(desired("web", "server:2")))
        .await
        .unwrap();
    assert_eq!(patched, ReconcileResult::Patched);
    assert_eq!(platform.deleted_pods(), pods("web", &[0, 1, 2]));
    assert_eq!(platform.peak_unavailable(), 1);

    platform.clear_mutations();
    let again = operator
        .reconcile(NAMESPACE, "web", Some(desired("web", "server:2")))
        .await
        .unwrap();
    assert_eq!(again, ReconcileResult::Noop);
    assert!(platform.mutations().is_empty());
}

#[tokio::test]
async fn counter_tokens_advance_only_on_change() {
    let platform = Arc::new(InMemoryPlatform::new());
    let operator = StatefulSetOperator::new(
        platform.clone(),
        Arc::new(TemplateCounter),
        Duration::from_secs(5),
        Duration::from_millis(1),
    );

    operator
        .reconcile(NAMESPACE, "web", Some(desired("web", "server:1")))
        .await
        .unwrap();
    assert_eq!(pod_token(&platform, "web-0").as_deref(), Some("0"));

    operator
        .reconcile(NAMESPACE, "web", Some(desired("web", "server:1")))
        .await
        .unwrap();
    assert!(platform.deleted_pods().is_empty());

    operator
        .reconcile(NAMESPACE, "web", Some(desired("web", "server:2")))
        .await
        .unwrap();
    let token = platform
        .object(ResourceKind::StatefulSet, NAMESPACE, "web")
        .and_then(|sts| {
            sts.pointer(&format!(
                "/spec/template/metadata/annotations/{}",
                ANNOTATION_GENERATION.replace('/', "~1")
            ))
            .cloned()
        });
    assert_eq!(token, Some(json!("1")));
    for ordinal in 0..3 {
        assert_eq!(
            pod_token(&platform, &format!("web-{}", ordinal)).as_deref(),
            Some("1")
        );
    }
    assert_eq!(platform.deleted_pods(), pods("web", &[0, 1, 2]));
}
