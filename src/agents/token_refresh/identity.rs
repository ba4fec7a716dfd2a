//! ServiceAccount identity: workload identity binding and projected tokens
//!
//! Reads the `azure.workload.identity/*` annotations from a ServiceAccount and
//! requests audience-scoped tokens for it through the TokenRequest API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{debug, info};

use super::types::{IdentityBinding, ProjectedToken, TokenRefreshError};

pub const TENANT_ID_ANNOTATION: &str = "azure.workload.identity/tenant-id";
pub const CLIENT_ID_ANNOTATION: &str = "azure.workload.identity/client-id";

/// Errors reported by an identity directory
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Request(String),
}

/// Read access to ServiceAccounts and the ability to mint tokens for them
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Annotations of the named ServiceAccount
    async fn lookup_principal(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, DirectoryError>;

    /// Issue a token bound to the named ServiceAccount for exactly `audiences`
    async fn issue_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: &[String],
    ) -> Result<String, DirectoryError>;
}

/// Resolve the tenant and client a ServiceAccount is federated with
///
/// Both annotations must be present and non-empty; nothing is defaulted.
pub async fn resolve_identity<D>(
    directory: &D,
    namespace: &str,
    service_account: &str,
) -> Result<IdentityBinding, TokenRefreshError>
where
    D: IdentityDirectory + ?Sized,
{
    debug!(namespace = %namespace, service_account = %service_account, "Looking up service account");

    let annotations = directory
        .lookup_principal(namespace, service_account)
        .await
        .map_err(|e| match e {
            DirectoryError::NotFound => TokenRefreshError::NotFound {
                namespace: namespace.to_string(),
                name: service_account.to_string(),
            },
            DirectoryError::Request(reason) => TokenRefreshError::LookupFailed {
                principal: service_account.to_string(),
                reason,
            },
        })?;

    let annotation = |key: &str| {
        annotations
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
    };

    let tenant_id = annotation(TENANT_ID_ANNOTATION);
    let client_id = annotation(CLIENT_ID_ANNOTATION);

    match (tenant_id, client_id) {
        (Some(tenant_id), Some(client_id)) => {
            info!(
                service_account = %service_account,
                tenant_id = %tenant_id,
                client_id = %client_id,
                "Resolved workload identity"
            );
            Ok(IdentityBinding {
                tenant_id,
                client_id,
            })
        }
        (tenant_id, client_id) => {
            let mut missing = Vec::new();
            if tenant_id.is_none() {
                missing.push(TENANT_ID_ANNOTATION);
            }
            if client_id.is_none() {
                missing.push(CLIENT_ID_ANNOTATION);
            }
            Err(TokenRefreshError::MissingMetadata {
                annotations: missing,
                principal: service_account.to_string(),
            })
        }
    }
}

/// Request a single projected token for the ServiceAccount
pub async fn fetch_projected_token<D>(
    directory: &D,
    namespace: &str,
    service_account: &str,
    audiences: &[String],
) -> Result<ProjectedToken, TokenRefreshError>
where
    D: IdentityDirectory + ?Sized,
{
    let failed = |reason: String| TokenRefreshError::TokenRequestFailed {
        principal: service_account.to_string(),
        reason,
    };

    if audiences.is_empty() {
        return Err(failed("at least one audience is required".to_string()));
    }

    let token = directory
        .issue_token(namespace, service_account, audiences)
        .await
        .map_err(|e| failed(e.to_string()))?;

    if token.is_empty() {
        return Err(failed("API server returned an empty token".to_string()));
    }

    info!(
        service_account = %service_account,
        audiences = ?audiences,
        "Projected service account token issued"
    );

    Ok(ProjectedToken::new(token, audiences.to_vec()))
}

/// `IdentityDirectory` backed by the Kubernetes API
pub struct KubeIdentityDirectory {
    client: Client,
}

impl KubeIdentityDirectory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn service_accounts(&self, namespace: &str) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl IdentityDirectory for KubeIdentityDirectory {
    async fn lookup_principal(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, DirectoryError> {
        let sa = self
            .service_accounts(namespace)
            .get_opt(name)
            .await
            .map_err(directory_error)?
            .ok_or(DirectoryError::NotFound)?;

        Ok(sa.metadata.annotations.unwrap_or_default())
    }

    async fn issue_token(
        &self,
        namespace: &str,
        name: &str,
        audiences: &[String],
    ) -> Result<String, DirectoryError> {
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: audiences.to_vec(),
                ..Default::default()
            },
            ..Default::default()
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| DirectoryError::Request(format!("failed to encode TokenRequest: {}", e)))?;

        let issued: TokenRequest = self
            .service_accounts(namespace)
            .create_subresource("token", name, &PostParams::default(), body)
            .await
            .map_err(directory_error)?;

        issued
            .status
            .map(|status| status.token)
            .ok_or_else(|| DirectoryError::Request("TokenRequest has no status".to_string()))
    }
}

fn directory_error(err: kube::Error) -> DirectoryError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => DirectoryError::NotFound,
        other => DirectoryError::Request(other.to_string()),
    }
}
