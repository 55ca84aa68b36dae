//! Reconciliation triggers.
//!
//! The periodic [`Sweeper`] is authoritative: every interval it submits one
//! request for every assembly it can find, either through the custom resource
//! or through objects still labelled as belonging to one, so an assembly
//! deleted while the operator was down still gets cleaned up. The watchers
//! only shorten the reaction time.

use super::{ControllerContext, ReconcileDispatcher, Reconciliation, Submission, Trigger};
use crate::crd::QuorumAssembly;
use crate::error::OperatorResult;
use crate::model::{LABEL_ASSEMBLY, managed_selector};
use crate::platform::{Labels, Platform, ResourceKind, object_labels, object_name, selector_string};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config, watcher};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Periodic full reconciliation.
pub struct Sweeper {
    platform: Arc<dyn Platform>,
    dispatcher: ReconcileDispatcher,
    namespaces: Vec<String>,
    interval: Duration,
}

impl Sweeper {
    /// Sweeper over the configured namespaces at the configured interval.
    pub fn new(ctx: Arc<ControllerContext>, dispatcher: ReconcileDispatcher) -> Self {
        Self {
            platform: ctx.platform.clone(),
            dispatcher,
            namespaces: ctx.config.namespaces().to_vec(),
            interval: ctx.config.sweep_interval(),
        }
    }

    /// Submit a timer request for every assembly found. Returns how many
    /// distinct assemblies were submitted.
    pub async fn sweep(&self) -> OperatorResult<usize> {
        let scopes: Vec<Option<&str>> = if self.namespaces.is_empty() {
            vec![None]
        } else {
            self.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        };

        let everything = Labels::new();
        let managed = managed_selector();
        let mut identities = BTreeSet::new();
        for scope in scopes {
            for object in self
                .platform
                .list(ResourceKind::QuorumAssembly, scope, &everything)
                .await?
            {
                if let (Some(namespace), Some(name)) = (object_namespace(&object), object_name(&object)) {
                    identities.insert((namespace.to_string(), name.to_string()));
                }
            }

            for kind in [ResourceKind::StatefulSet, ResourceKind::Secret] {
                for object in self.platform.list(kind, scope, &managed).await? {
                    let owner = object_labels(&object).get(LABEL_ASSEMBLY).cloned();
                    if let (Some(namespace), Some(name)) = (object_namespace(&object), owner) {
                        identities.insert((namespace.to_string(), name));
                    }
                }
            }
        }

        let count = identities.len();
        for (namespace, name) in identities {
            self.dispatcher
                .submit(Reconciliation::new(Trigger::Timer, namespace, name));
        }
        Ok(count)
    }

    /// Sweep forever.
    pub async fn run(self) {
        info!(interval = ?self.interval, namespaces = ?self.namespaces, "Periodic reconciliation started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(count) => info!(assemblies = count, "Periodic reconciliation submitted"),
                Err(e) => error!(error = %e, "Periodic reconciliation failed"),
            }
        }
    }
}

fn object_namespace(object: &Value) -> Option<&str> {
    object.pointer("/metadata/namespace").and_then(Value::as_str)
}

fn submit(dispatcher: &ReconcileDispatcher, namespace: Option<String>, name: String) {
    let Some(namespace) = namespace else {
        return;
    };
    let request = Reconciliation::new(Trigger::Watch, namespace, name);
    if let Submission::Coalesced = dispatcher.submit(request) {
        tracing::trace!("Watch event folded into pending reconciliation");
    }
}

/// Watch QuorumAssembly objects and submit a request on every change.
pub async fn watch_assemblies(
    client: Client,
    namespace: Option<String>,
    dispatcher: ReconcileDispatcher,
) -> OperatorResult<()> {
    let api: Api<QuorumAssembly> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let mut stream = watcher(api, Config::default()).default_backoff().boxed();
    info!(namespace = ?namespace, "Assembly watcher started");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(assembly))
            | Ok(watcher::Event::InitApply(assembly))
            | Ok(watcher::Event::Delete(assembly)) => {
                submit(&dispatcher, assembly.namespace(), assembly.name_any());
            }
            Ok(watcher::Event::Init) => {}
            Ok(watcher::Event::InitDone) => {
                info!("Assembly watcher initialization complete");
            }
            Err(e) => {
                error!(error = %e, "Assembly watch error");
            }
        }
    }

    warn!("Assembly watcher stream ended");
    Ok(())
}

/// Watch managed StatefulSets and submit a request for the owning assembly.
pub async fn watch_stateful_sets(
    client: Client,
    namespace: Option<String>,
    dispatcher: ReconcileDispatcher,
) -> OperatorResult<()> {
    let api: Api<StatefulSet> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let config = Config::default().labels(&selector_string(&managed_selector()));
    let mut stream = watcher(api, config).default_backoff().boxed();
    info!(namespace = ?namespace, "StatefulSet watcher started");

    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(sts)) | Ok(watcher::Event::Delete(sts)) => {
                if let Some(assembly) = sts.labels().get(LABEL_ASSEMBLY).cloned() {
                    submit(&dispatcher, sts.namespace(), assembly);
                }
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitApply(_)) => {}
            Ok(watcher::Event::InitDone) => {
                info!("StatefulSet watcher initialization complete");
            }
            Err(e) => {
                error!(error = %e, "StatefulSet watch error");
            }
        }
    }

    warn!("StatefulSet watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::RcgenCertManager;
    use crate::config::OperatorConfig;
    use crate::controller::{ReconcileOutcome, Reconciler};
    use crate::model::{Component, component_labels};
    use crate::platform::PlatformFuture;
    use crate::platform::memory::InMemoryPlatform;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    impl Reconciler for Recording {
        fn reconcile<'a>(
            &'a self,
            request: &'a Reconciliation,
        ) -> PlatformFuture<'a, ReconcileOutcome> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .push(format!("{}/{}", request.namespace, request.name));
                Ok(ReconcileOutcome::Converged)
            })
        }
    }

    #[tokio::test]
    async fn sweep_finds_assemblies_and_orphans() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.seed(
            ResourceKind::QuorumAssembly,
            "ns",
            json!({"metadata": {"name": "live"}, "spec": {}}),
        );
        platform.seed(
            ResourceKind::StatefulSet,
            "ns",
            json!({"metadata": {"name": "gone-cluster", "labels": component_labels("gone", Component::Cluster)}}),
        );
        platform.seed(
            ResourceKind::StatefulSet,
            "ns",
            json!({"metadata": {"name": "live-cluster", "labels": component_labels("live", Component::Cluster)}}),
        );
        platform.seed(
            ResourceKind::StatefulSet,
            "other",
            json!({"metadata": {"name": "foreign", "labels": {"app": "x"}}}),
        );

        let ctx = Arc::new(ControllerContext::new(
            platform.clone(),
            platform.clone(),
            Arc::new(RcgenCertManager),
            OperatorConfig::default(),
        ));
        let recording = Arc::new(Recording::default());
        let dispatcher = ReconcileDispatcher::new(recording.clone(), 2);
        let sweeper = Sweeper::new(ctx, dispatcher.clone());

        assert_eq!(sweeper.sweep().await.expect("sweep"), 2);
        while dispatcher.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        let mut seen = recording.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["ns/gone", "ns/live"]);
    }
}
