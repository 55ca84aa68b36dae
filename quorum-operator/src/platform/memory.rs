//! In-memory platform.
//!
//! Stores objects as JSON and simulates the parts of the platform the rolling
//! update depends on: the StatefulSet controller creates pods from the current
//! template, recreates deleted pods after a configurable number of reads and
//! removes pods when their StatefulSet goes away. Every mutation issued
//! through the [`Platform`] trait is recorded so tests can assert on order.

use super::{
    Labels, Platform, PlatformFuture, ResourceKind, RestRequest, RestResponse, RestTransport,
    labels_match, object_labels, object_name,
};
use super::merge::{apply_merge_patch, apply_owned};
use crate::error::{OperatorError, OperatorResult};
use http::Method;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// Reads after a pod deletion before its replacement appears.
pub const DEFAULT_RECREATE_AFTER_READS: u32 = 2;

/// Platform verb, used for the mutation log and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Verb {
    Get,
    List,
    Create,
    Patch,
    Delete,
    PatchStatus,
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Write verb.
    pub verb: Verb,
    /// Kind of the mutated object.
    pub kind: ResourceKind,
    /// Object namespace.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

#[derive(Debug, Clone)]
struct Fault {
    verb: Verb,
    kind: ResourceKind,
    name: Option<String>,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct PendingPod {
    namespace: String,
    stateful_set: String,
    ordinal: i32,
    reads_left: u32,
}

type ObjectKey = (ResourceKind, String, String);

#[derive(Debug)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    applied: BTreeMap<ObjectKey, Value>,
    next_version: u64,
    mutations: Vec<Mutation>,
    faults: Vec<Fault>,
    pending: Vec<PendingPod>,
    provision_pods: bool,
    recreate_after_reads: u32,
    recreated_pods_ready: bool,
    unavailable: BTreeSet<(String, String)>,
    peak_unavailable: usize,
    rest_objects: BTreeMap<String, Value>,
    rest_calls: Vec<(Method, String)>,
    rest_overrides: BTreeMap<String, u16>,
}

/// In-process [`Platform`] and [`RestTransport`].
#[derive(Debug)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    /// Empty platform with pod simulation enabled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                applied: BTreeMap::new(),
                next_version: 1,
                mutations: Vec::new(),
                faults: Vec::new(),
                pending: Vec::new(),
                provision_pods: true,
                recreate_after_reads: DEFAULT_RECREATE_AFTER_READS,
                recreated_pods_ready: true,
                unavailable: BTreeSet::new(),
                peak_unavailable: 0,
                rest_objects: BTreeMap::new(),
                rest_calls: Vec::new(),
                rest_overrides: BTreeMap::new(),
            }),
        }
    }

    /// Whether creating or scaling a StatefulSet creates its pods.
    pub fn set_provision_pods(&self, enabled: bool) {
        self.state.lock().provision_pods = enabled;
    }

    /// Reads after a pod deletion before the replacement appears. `0` means
    /// the replacement appears on the next read.
    pub fn set_recreate_after_reads(&self, reads: u32) {
        self.state.lock().recreate_after_reads = reads;
    }

    /// Whether recreated pods report Ready.
    pub fn set_recreated_pods_ready(&self, ready: bool) {
        self.state.lock().recreated_pods_ready = ready;
    }

    /// Fail every matching call until [`clear_faults`](Self::clear_faults).
    pub fn fail(&self, verb: Verb, kind: ResourceKind, name: Option<&str>) {
        self.push_fault(verb, kind, name, None);
    }

    /// Fail the next matching call only.
    pub fn fail_once(&self, verb: Verb, kind: ResourceKind, name: Option<&str>) {
        self.push_fault(verb, kind, name, Some(1));
    }

    fn push_fault(&self, verb: Verb, kind: ResourceKind, name: Option<&str>, times: Option<u32>) {
        self.state.lock().faults.push(Fault {
            verb,
            kind,
            name: name.map(String::from),
            remaining: times,
        });
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Store an object directly, bypassing the log and pod simulation.
    pub fn seed(&self, kind: ResourceKind, namespace: &str, mut object: Value) {
        let mut state = self.state.lock();
        let name = object_name(&object).unwrap_or_default().to_string();
        stamp_identity(&mut state, &mut object, namespace, &name, true);
        let key = (kind, namespace.to_string(), name);
        state.applied.remove(&key);
        state.objects.insert(key, object);
    }

    /// Mutate a stored object in place, bypassing the log.
    pub fn modify<F>(&self, kind: ResourceKind, namespace: &str, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.state.lock();
        let version = bump_version(&mut state);
        match state
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            Some(object) => {
                f(object);
                object["metadata"]["resourceVersion"] = json!(version);
                true
            }
            None => false,
        }
    }

    /// Read a stored object without counting as a read.
    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Whether an object exists.
    pub fn contains(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        self.object(kind, namespace, name).is_some()
    }

    /// Names of all stored objects of a kind in a namespace.
    pub fn names(&self, kind: ResourceKind, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Mutations issued so far, oldest first.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state.lock().mutations.clone()
    }

    /// Forget recorded mutations.
    pub fn clear_mutations(&self) {
        self.state.lock().mutations.clear();
    }

    /// Names of deleted pods, in deletion order.
    pub fn deleted_pods(&self) -> Vec<String> {
        self.mutations()
            .into_iter()
            .filter(|m| m.verb == Verb::Delete && m.kind == ResourceKind::Pod)
            .map(|m| m.name)
            .collect()
    }

    /// Highest number of pods that were gone or not ready at the same time
    /// because of a deletion.
    pub fn peak_unavailable(&self) -> usize {
        self.state.lock().peak_unavailable
    }

    /// Store a raw REST object at `path`.
    pub fn seed_rest(&self, path: &str, object: Value) {
        self.state
            .lock()
            .rest_objects
            .insert(path.to_string(), object);
    }

    /// Raw REST object stored at `path`.
    pub fn rest_object(&self, path: &str) -> Option<Value> {
        self.state.lock().rest_objects.get(path).cloned()
    }

    /// Raw REST calls issued so far.
    pub fn rest_calls(&self) -> Vec<(Method, String)> {
        self.state.lock().rest_calls.clone()
    }

    /// Answer every `method` request with `status`.
    pub fn force_rest_status(&self, method: Method, status: u16) {
        self.state
            .lock()
            .rest_overrides
            .insert(method.as_str().to_string(), status);
    }

    fn check_fault(
        state: &mut State,
        verb: Verb,
        kind: ResourceKind,
        name: &str,
    ) -> OperatorResult<()> {
        let position = state.faults.iter().position(|f| {
            f.verb == verb && f.kind == kind && f.name.as_deref().is_none_or(|n| n == name)
        });
        let Some(index) = position else {
            return Ok(());
        };

        let exhausted = match state.faults[index].remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            state.faults.remove(index);
        }
        Err(OperatorError::Platform(format!(
            "injected failure: {:?} {}/{}",
            verb, kind, name
        )))
    }

    fn record(state: &mut State, verb: Verb, kind: ResourceKind, namespace: &str, name: &str) {
        state.mutations.push(Mutation {
            verb,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
}

fn bump_version(state: &mut State) -> String {
    let version = state.next_version;
    state.next_version += 1;
    version.to_string()
}

fn stamp_identity(state: &mut State, object: &mut Value, namespace: &str, name: &str, new: bool) {
    let version = bump_version(state);
    if !object.get("metadata").is_some_and(Value::is_object) {
        object["metadata"] = json!({});
    }
    let metadata = &mut object["metadata"];
    metadata["name"] = json!(name);
    metadata["namespace"] = json!(namespace);
    metadata["resourceVersion"] = json!(version);
    if new || metadata.get("uid").is_none() {
        metadata["uid"] = json!(uuid::Uuid::new_v4().to_string());
    }
    if metadata.get("generation").is_none() {
        metadata["generation"] = json!(1);
    }
}

fn stateful_set_replicas(sts: &Value) -> i32 {
    sts.pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1) as i32
}

fn pod_owner(pod: &Value) -> Option<String> {
    pod.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)?
        .iter()
        .find(|r| r.get("kind").and_then(Value::as_str) == Some("StatefulSet"))
        .and_then(|r| r.get("name").and_then(Value::as_str))
        .map(String::from)
}

fn pod_ordinal(stateful_set: &str, pod: &str) -> Option<i32> {
    pod.strip_prefix(stateful_set)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

fn pod_from_template(
    state: &mut State,
    namespace: &str,
    stateful_set: &str,
    ordinal: i32,
    ready: bool,
) -> Option<Value> {
    let sts = state
        .objects
        .get(&(
            ResourceKind::StatefulSet,
            namespace.to_string(),
            stateful_set.to_string(),
        ))?
        .clone();
    let template = sts.pointer("/spec/template").cloned().unwrap_or(json!({}));
    let name = format!("{}-{}", stateful_set, ordinal);

    let mut labels = template
        .pointer("/metadata/labels")
        .cloned()
        .unwrap_or(json!({}));
    labels["statefulset.kubernetes.io/pod-name"] = json!(name);

    let mut pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": template.pointer("/metadata/annotations").cloned().unwrap_or(json!({})),
            "ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "StatefulSet",
                "name": stateful_set,
                "uid": sts.pointer("/metadata/uid").cloned().unwrap_or(Value::Null),
                "controller": true
            }]
        },
        "spec": template.get("spec").cloned().unwrap_or(json!({})),
        "status": {
            "phase": "Running",
            "conditions": [{
                "type": "Ready",
                "status": if ready { "True" } else { "False" }
            }]
        }
    });
    stamp_identity(state, &mut pod, namespace, &name, true);
    Some(pod)
}

impl State {
    fn provision(&mut self, namespace: &str, stateful_set: &str) {
        if !self.provision_pods {
            return;
        }
        let key = (
            ResourceKind::StatefulSet,
            namespace.to_string(),
            stateful_set.to_string(),
        );
        let Some(replicas) = self.objects.get(&key).map(stateful_set_replicas) else {
            return;
        };

        for ordinal in 0..replicas {
            let name = format!("{}-{}", stateful_set, ordinal);
            let pod_key = (ResourceKind::Pod, namespace.to_string(), name);
            let pending = self.pending.iter().any(|p| {
                p.namespace == namespace && p.stateful_set == stateful_set && p.ordinal == ordinal
            });
            if self.objects.contains_key(&pod_key) || pending {
                continue;
            }
            if let Some(pod) = pod_from_template(self, namespace, stateful_set, ordinal, true) {
                self.objects.insert(pod_key, pod);
            }
        }

        let stale: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|((kind, ns, name), pod)| {
                *kind == ResourceKind::Pod
                    && ns == namespace
                    && pod_owner(pod).as_deref() == Some(stateful_set)
                    && pod_ordinal(stateful_set, name).is_some_and(|o| o >= replicas)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.objects.remove(&key);
        }
        self.pending.retain(|p| {
            !(p.namespace == namespace && p.stateful_set == stateful_set && p.ordinal >= replicas)
        });
    }

    fn owner_replicas(&self, namespace: &str, stateful_set: &str) -> Option<i32> {
        self.objects
            .get(&(
                ResourceKind::StatefulSet,
                namespace.to_string(),
                stateful_set.to_string(),
            ))
            .map(stateful_set_replicas)
    }

    fn remove_pods_of(&mut self, namespace: &str, stateful_set: &str) {
        self.objects.retain(|(kind, ns, _), object| {
            !(*kind == ResourceKind::Pod
                && ns == namespace
                && pod_owner(object).as_deref() == Some(stateful_set))
        });
        self.pending
            .retain(|p| !(p.namespace == namespace && p.stateful_set == stateful_set));
    }

    fn tick(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut due = Vec::new();
        for pending in self.pending.iter_mut() {
            if pending.reads_left == 0 {
                due.push(pending.clone());
            } else {
                pending.reads_left -= 1;
                if pending.reads_left == 0 {
                    due.push(pending.clone());
                }
            }
        }
        self.pending.retain(|p| p.reads_left > 0);

        let ready = self.recreated_pods_ready;
        for pending in due {
            let name = format!("{}-{}", pending.stateful_set, pending.ordinal);
            let wanted = self
                .owner_replicas(&pending.namespace, &pending.stateful_set)
                .is_some_and(|replicas| pending.ordinal < replicas);
            if !wanted {
                self.unavailable.remove(&(pending.namespace.clone(), name));
                continue;
            }
            let Some(pod) = pod_from_template(
                self,
                &pending.namespace,
                &pending.stateful_set,
                pending.ordinal,
                ready,
            ) else {
                continue;
            };
            if ready {
                self.unavailable
                    .remove(&(pending.namespace.clone(), name.clone()));
            }
            self.objects
                .insert((ResourceKind::Pod, pending.namespace, name), pod);
        }
    }

    fn mark_unavailable(&mut self, namespace: &str, pod: &str) {
        self.unavailable
            .insert((namespace.to_string(), pod.to_string()));
        self.peak_unavailable = self.peak_unavailable.max(self.unavailable.len());
    }
}

impl Platform for InMemoryPlatform {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, Option<Value>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state, Verb::Get, kind, name)?;
            state.tick();
            Ok(state
                .objects
                .get(&(kind, namespace.to_string(), name.to_string()))
                .cloned())
        })
    }

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: &'a Labels,
    ) -> PlatformFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state, Verb::List, kind, "")?;
            state.tick();
            Ok(state
                .objects
                .iter()
                .filter(|((k, ns, _), object)| {
                    *k == kind
                        && namespace.is_none_or(|wanted| wanted == ns)
                        && labels_match(&object_labels(object), selector)
                })
                .map(|(_, object)| object.clone())
                .collect())
        })
    }

    fn apply<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        mut object: Value,
    ) -> PlatformFuture<'a, Value> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let key = (kind, namespace.to_string(), name.to_string());
            let existing = state.objects.get(&key).cloned();
            let verb = if existing.is_some() {
                Verb::Patch
            } else {
                Verb::Create
            };
            Self::check_fault(&mut state, verb, kind, name)?;

            let expected = object
                .get_mut("metadata")
                .and_then(Value::as_object_mut)
                .and_then(|m| m.remove("resourceVersion"));
            if let Some(expected) = expected {
                let actual = existing
                    .as_ref()
                    .and_then(|current| current.pointer("/metadata/resourceVersion"));
                if actual != Some(&expected) {
                    return Err(OperatorError::Conflict {
                        kind: kind.to_string(),
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                    });
                }
            }

            let mut next = existing.clone().unwrap_or_else(|| json!({}));
            apply_owned(&mut next, state.applied.get(&key), &object);
            state.applied.insert(key.clone(), object);
            if let Some(current) = existing.filter(|current| *current == next) {
                return Ok(current);
            }

            stamp_identity(&mut state, &mut next, namespace, name, verb == Verb::Create);
            state.objects.insert(key, next.clone());
            Self::record(&mut state, verb, kind, namespace, name);

            if kind == ResourceKind::StatefulSet {
                state.provision(namespace, name);
            }
            Ok(next)
        })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state, Verb::Delete, kind, name)?;

            let key = (kind, namespace.to_string(), name.to_string());
            let Some(removed) = state.objects.remove(&key) else {
                return Ok(false);
            };
            state.applied.remove(&key);
            Self::record(&mut state, Verb::Delete, kind, namespace, name);

            match kind {
                ResourceKind::StatefulSet => state.remove_pods_of(namespace, name),
                ResourceKind::Pod => {
                    if let Some(owner) = pod_owner(&removed) {
                        let replicas = state.owner_replicas(namespace, &owner);
                        let ordinal = pod_ordinal(&owner, name)
                            .filter(|ordinal| replicas.is_some_and(|r| *ordinal < r));
                        if let Some(ordinal) = ordinal {
                            state.mark_unavailable(namespace, name);
                            let reads_left = state.recreate_after_reads;
                            state.pending.push(PendingPod {
                                namespace: namespace.to_string(),
                                stateful_set: owner,
                                ordinal,
                                reads_left,
                            });
                        }
                    }
                }
                _ => {}
            }
            Ok(true)
        })
    }

    fn patch_status<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        status: Value,
    ) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state, Verb::PatchStatus, kind, name)?;

            let key = (kind, namespace.to_string(), name.to_string());
            let Some(mut current) = state.objects.get(&key).cloned() else {
                return Err(OperatorError::NotFound {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                });
            };
            apply_merge_patch(&mut current, &json!({ "status": status }));
            stamp_identity(&mut state, &mut current, namespace, name, false);
            state.objects.insert(key, current);
            Self::record(&mut state, Verb::PatchStatus, kind, namespace, name);
            Ok(())
        })
    }
}

impl RestTransport for InMemoryPlatform {
    fn execute(&self, request: RestRequest) -> PlatformFuture<'_, RestResponse> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state
                .rest_calls
                .push((request.method.clone(), request.path.clone()));

            if let Some(status) = state.rest_overrides.get(request.method.as_str()) {
                return Ok(RestResponse {
                    status: *status,
                    body: String::new(),
                });
            }

            let path = request.path;
            let response = match request.method {
                Method::GET => match state.rest_objects.get(&path) {
                    Some(object) => RestResponse {
                        status: 200,
                        body: object.to_string(),
                    },
                    None => not_found(),
                },
                Method::PUT => match request.body {
                    Some(body) if state.rest_objects.contains_key(&path) => {
                        let text = body.to_string();
                        state.rest_objects.insert(path, body);
                        RestResponse {
                            status: 200,
                            body: text,
                        }
                    }
                    _ => not_found(),
                },
                Method::POST => {
                    let body = request.body.unwrap_or(Value::Null);
                    let name = object_name(&body).unwrap_or_default().to_string();
                    let item_path = format!("{}/{}", path, name);
                    if state.rest_objects.contains_key(&item_path) {
                        RestResponse {
                            status: 409,
                            body: "AlreadyExists".into(),
                        }
                    } else {
                        let text = body.to_string();
                        state.rest_objects.insert(item_path, body);
                        RestResponse {
                            status: 201,
                            body: text,
                        }
                    }
                }
                Method::DELETE => match state.rest_objects.remove(&path) {
                    Some(_) => RestResponse {
                        status: 200,
                        body: String::new(),
                    },
                    None => not_found(),
                },
                _ => RestResponse {
                    status: 405,
                    body: "MethodNotAllowed".into(),
                },
            };
            Ok(response)
        })
    }
}

fn not_found() -> RestResponse {
    RestResponse {
        status: 404,
        body: "NotFound".into(),
    }
}
