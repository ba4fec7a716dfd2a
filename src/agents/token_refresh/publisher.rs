//! Credential publishing
//!
//! Writes the access token into the `password` field of a Kubernetes Secret
//! with a JSON merge patch, so fields owned by other writers stay untouched.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use super::types::{FederatedAccessToken, TokenRefreshError};

/// Secret data key holding the access token
pub const PASSWORD_FIELD: &str = "password";

const FIELD_MANAGER: &str = "workload-token-agent";

/// The credential store did not apply a patch
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Persistent storage for credentials, updated with merge patches only
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Apply `merge_patch` to the named Secret and return the result
    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Secret, StoreError>;
}

/// Merge patch setting `data.password` to the base64 encoded token
pub fn password_patch(token: &FederatedAccessToken) -> Value {
    json!({
        "data": {
            PASSWORD_FIELD: STANDARD.encode(token.expose().as_bytes()),
        }
    })
}

/// Overwrite the Secret's password with the new access token
pub async fn publish_access_token<S>(
    store: &S,
    namespace: &str,
    secret_name: &str,
    token: &FederatedAccessToken,
) -> Result<Secret, TokenRefreshError>
where
    S: CredentialStore + ?Sized,
{
    debug!(namespace = %namespace, secret = %secret_name, "Patching secret");

    let patch = password_patch(token);
    let secret = store
        .patch_secret(namespace, secret_name, &patch)
        .await
        .map_err(|e| TokenRefreshError::PublishFailed {
            secret: format!("{}/{}", namespace, secret_name),
            reason: e.to_string(),
        })?;

    info!(
        namespace = %namespace,
        secret = %secret_name,
        resource_version = secret.metadata.resource_version.as_deref().unwrap_or("unknown"),
        "Secret password updated"
    );

    Ok(secret)
}

/// `CredentialStore` backed by Kubernetes Secrets
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialStore for KubeSecretStore {
    async fn patch_secret(
        &self,
        namespace: &str,
        name: &str,
        merge_patch: &Value,
    ) -> Result<Secret, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        api.patch(name, &params, &Patch::Merge(merge_patch))
            .await
            .map_err(|e| StoreError(e.to_string()))
    }
}
