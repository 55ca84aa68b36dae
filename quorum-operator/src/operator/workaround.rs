//! Converge over raw REST calls.
//!
//! Used for kinds the typed platform client does not cover. It speaks plain
//! HTTP verbs against `apis/<group>/<version>/<plural>` and treats any status
//! code outside the accepted set for a verb as a failure.

use super::{Converge, ReconcileResult};
use crate::error::{OperatorError, OperatorResult};
use crate::platform::{PlatformFuture, RestRequest, RestResponse, RestTransport};
use http::Method;
use serde_json::Value;
use std::sync::Arc;

const GET_OK: &[u16] = &[200];
const PUT_OK: &[u16] = &[200, 201];
const POST_OK: &[u16] = &[200, 201, 202];
const DELETE_OK: &[u16] = &[200, 202];

/// Converge for one cluster-scoped REST collection.
#[derive(Clone)]
pub struct WorkaroundOperator {
    transport: Arc<dyn RestTransport>,
    group: String,
    version: String,
    plural: String,
}

impl WorkaroundOperator {
    /// Create an operator for `apis/<group>/<version>/<plural>`.
    pub fn new(
        transport: Arc<dyn RestTransport>,
        group: impl Into<String>,
        version: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            group: group.into(),
            version: version.into(),
            plural: plural.into(),
        }
    }

    /// Operator for `rbac.authorization.k8s.io/v1` ClusterRoleBindings.
    pub fn cluster_role_bindings(transport: Arc<dyn RestTransport>) -> Self {
        Self::new(
            transport,
            "rbac.authorization.k8s.io",
            "v1",
            "clusterrolebindings",
        )
    }

    /// Path of the collection.
    pub fn collection_path(&self) -> String {
        format!("apis/{}/{}/{}", self.group, self.version, self.plural)
    }

    /// Path of one named object.
    pub fn item_path(&self, name: &str) -> String {
        format!("{}/{}", self.collection_path(), name)
    }

    /// Read one object; `None` on 404.
    pub async fn get(&self, name: &str) -> OperatorResult<Option<Value>> {
        let path = self.item_path(name);
        let response = self
            .transport
            .execute(RestRequest {
                method: Method::GET,
                path: path.clone(),
                body: None,
            })
            .await?;

        if response.status == 404 {
            return Ok(None);
        }
        let response = accept(&Method::GET, &path, response, GET_OK)?;
        Ok(Some(serde_json::from_str(&response.body)?))
    }

    /// Converge `name` to `desired`.
    ///
    /// Found and desired: PUT. Found and not desired: DELETE. Missing and
    /// desired: POST to the collection. Missing and not desired: nothing.
    pub async fn reconcile(
        &self,
        name: &str,
        desired: Option<Value>,
    ) -> OperatorResult<ReconcileResult> {
        let exists = self.get(name).await?.is_some();

        let (method, path, body, accepted, result) = match (exists, desired) {
            (true, Some(desired)) => (
                Method::PUT,
                self.item_path(name),
                Some(desired),
                PUT_OK,
                ReconcileResult::Patched,
            ),
            (true, None) => (
                Method::DELETE,
                self.item_path(name),
                None,
                DELETE_OK,
                ReconcileResult::Deleted,
            ),
            (false, Some(desired)) => (
                Method::POST,
                self.collection_path(),
                Some(desired),
                POST_OK,
                ReconcileResult::Created,
            ),
            (false, None) => {
                tracing::debug!(path = %self.item_path(name), "Nothing to delete");
                return Ok(ReconcileResult::Noop);
            }
        };

        tracing::debug!(method = %method, path = %path, "Making request");
        let response = self
            .transport
            .execute(RestRequest {
                method: method.clone(),
                path: path.clone(),
                body,
            })
            .await?;
        accept(&method, &path, response, accepted)?;
        Ok(result)
    }
}

fn accept(
    method: &Method,
    path: &str,
    response: RestResponse,
    accepted: &[u16],
) -> OperatorResult<RestResponse> {
    if accepted.contains(&response.status) {
        return Ok(response);
    }
    Err(OperatorError::UnexpectedStatus {
        method: method.to_string(),
        path: path.to_string(),
        status: response.status,
        message: response.body,
    })
}

impl Converge<Value> for WorkaroundOperator {
    fn converge<'a>(
        &'a self,
        _namespace: &'a str,
        name: &'a str,
        desired: Option<Value>,
    ) -> PlatformFuture<'a, ReconcileResult> {
        Box::pin(self.reconcile(name, desired))
    }
}
