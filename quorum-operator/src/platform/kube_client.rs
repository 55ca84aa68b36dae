//! [`Platform`] over a live Kubernetes API server.

use super::{
    FIELD_MANAGER, Labels, Platform, PlatformFuture, ResourceKind, RestRequest, RestResponse, RestTransport,
    selector_string,
};
use crate::crd::QuorumAssembly;
use crate::error::{OperatorError, OperatorResult};
use bytes::Bytes;
use http_body_util::BodyExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams,
};
use kube::{Api, Client};

/// Platform backed by `kube::Client`.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    /// Wrap a connected client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Service => ApiResource::erase::<Service>(&()),
        ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
        ResourceKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
        ResourceKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
        ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
        ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
        ResourceKind::QuorumAssembly => ApiResource::erase::<QuorumAssembly>(&()),
    }
}

fn map_conflict(
    err: kube::Error,
    kind: ResourceKind,
    namespace: &str,
    name: &str,
) -> OperatorError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 409 => OperatorError::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        other => other.into(),
    }
}

impl Platform for KubePlatform {
    fn get<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, Option<serde_json::Value>> {
        Box::pin(async move {
            let object = self.api(kind, Some(namespace)).get_opt(name).await?;
            object
                .map(|o| serde_json::to_value(o).map_err(OperatorError::from))
                .transpose()
        })
    }

    fn list<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: Option<&'a str>,
        selector: &'a Labels,
    ) -> PlatformFuture<'a, Vec<serde_json::Value>> {
        Box::pin(async move {
            let mut params = ListParams::default();
            if !selector.is_empty() {
                params = params.labels(&selector_string(selector));
            }
            let list = self.api(kind, namespace).list(&params).await?;
            list.items
                .into_iter()
                .map(|o| serde_json::to_value(o).map_err(OperatorError::from))
                .collect()
        })
    }

    fn apply<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        object: serde_json::Value,
    ) -> PlatformFuture<'a, serde_json::Value> {
        Box::pin(async move {
            let params = PatchParams::apply(FIELD_MANAGER).force();
            let applied = self
                .api(kind, Some(namespace))
                .patch(name, &params, &Patch::Apply(&object))
                .await
                .map_err(|e| map_conflict(e, kind, namespace, name))?;
            Ok(serde_json::to_value(applied)?)
        })
    }

    fn delete<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, bool> {
        Box::pin(async move {
            match self
                .api(kind, Some(namespace))
                .delete(name, &DeleteParams::default())
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(err)) if err.code == 404 => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn patch_status<'a>(
        &'a self,
        kind: ResourceKind,
        namespace: &'a str,
        name: &'a str,
        status: serde_json::Value,
    ) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            let patch = serde_json::json!({ "status": status });
            self.api(kind, Some(namespace))
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| map_conflict(e, kind, namespace, name))?;
            Ok(())
        })
    }
}

impl RestTransport for KubePlatform {
    fn execute(&self, request: RestRequest) -> PlatformFuture<'_, RestResponse> {
        Box::pin(async move { self.send_raw(request).await })
    }
}

impl KubePlatform {
    async fn send_raw(&self, request: RestRequest) -> OperatorResult<RestResponse> {
        let body = match &request.body {
            Some(value) => Bytes::from(serde_json::to_vec(value)?),
            None => Bytes::new(),
        };

        let http_request = http::Request::builder()
            .method(request.method.clone())
            .uri(format!("/{}", request.path))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(kube::client::Body::from(body))
            .map_err(|e| OperatorError::HttpError(format!("Failed to build request: {}", e)))?;

        tracing::debug!(method = %request.method, path = %request.path, "Making request");
        let response = self.client.send(http_request).await?;
        let status = response.status().as_u16();

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| OperatorError::HttpError(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        tracing::debug!(method = %request.method, path = %request.path, status, "Got response");
        Ok(RestResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
