//! Entra ID token exchange
//!
//! Trades a projected ServiceAccount token for an Entra ID access token using
//! the OAuth2 client credentials grant with a JWT bearer client assertion.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::types::{FederatedAccessToken, IdentityBinding, ProjectedToken, TokenRefreshError};

/// Azure DevOps resource the access token is requested for
pub const AZURE_DEVOPS_RESOURCE_ID: &str = "499b84ac-1321-427f-aa17-267ca6975798";

/// Scope suffix Entra ID requires on resource identifiers
pub const DEFAULT_SCOPE_SUFFIX: &str = ".default";

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Express a resource identifier as an OAuth2 scope
///
/// Appends `/.default` unless the identifier already carries the suffix.
pub fn default_scope(resource: &str) -> String {
    if resource.contains(DEFAULT_SCOPE_SUFFIX) {
        resource.to_string()
    } else {
        format!("{}/{}", resource, DEFAULT_SCOPE_SUFFIX)
    }
}

/// The client assertion could not be produced
#[derive(Debug, Error)]
#[error("client assertion unavailable: {0}")]
pub struct AssertionUnavailable(pub String);

/// Supplies the signed assertion presented as the client credential
///
/// Called once per exchange attempt; implementations must not cache across calls.
#[async_trait]
pub trait AssertionSource: Send + Sync {
    async fn provide(&self) -> Result<SecretString, AssertionUnavailable>;
}

/// Assertion backed by the projected token issued for this run
pub struct ProjectedAssertion {
    token: SecretString,
}

impl From<ProjectedToken> for ProjectedAssertion {
    fn from(token: ProjectedToken) -> Self {
        Self {
            token: token.into_secret(),
        }
    }
}

#[async_trait]
impl AssertionSource for ProjectedAssertion {
    async fn provide(&self) -> Result<SecretString, AssertionUnavailable> {
        Ok(SecretString::new(self.token.expose_secret().clone()))
    }
}

/// Exchanges a client assertion for a federated access token
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        binding: &IdentityBinding,
        assertion: &dyn AssertionSource,
    ) -> Result<FederatedAccessToken, TokenRefreshError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// `TokenExchanger` talking to the Entra ID v2.0 token endpoint
pub struct EntraTokenExchanger {
    http_client: reqwest::Client,
    authority_host: String,
    resource_id: String,
}

impl EntraTokenExchanger {
    /// Create an exchanger for the given authority host
    pub fn new(authority_host: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            authority_host: authority_host.trim_end_matches('/').to_string(),
            resource_id: AZURE_DEVOPS_RESOURCE_ID.to_string(),
        })
    }

    /// Token endpoint for a tenant
    pub fn token_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant_id)
    }
}

#[async_trait]
impl TokenExchanger for EntraTokenExchanger {
    async fn exchange(
        &self,
        binding: &IdentityBinding,
        assertion: &dyn AssertionSource,
    ) -> Result<FederatedAccessToken, TokenRefreshError> {
        let assertion = assertion
            .provide()
            .await
            .map_err(|e| TokenRefreshError::ExchangeFailed(e.to_string()))?;
        let scope = default_scope(&self.resource_id);
        let token_url = self.token_endpoint(&binding.tenant_id);

        debug!(
            token_url = %token_url,
            client_id = %binding.client_id,
            scope = %scope,
            "Requesting Entra ID access token"
        );

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", binding.client_id.as_str()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.expose_secret().as_str()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http_client
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                TokenRefreshError::ExchangeFailed(redact(
                    &format!("request to {} failed: {}", token_url, e),
                    &assertion,
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => body_excerpt(&redact(&body, &assertion)),
            };
            return Err(TokenRefreshError::ExchangeFailed(redact(
                &format!("Entra ID returned {}: {}", status, detail),
                &assertion,
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            TokenRefreshError::ExchangeFailed(format!("failed to parse token response: {}", e))
        })?;

        if token.access_token.is_empty() {
            return Err(TokenRefreshError::ExchangeFailed(
                "token response carried an empty access_token".to_string(),
            ));
        }

        info!(
            tenant_id = %binding.tenant_id,
            client_id = %binding.client_id,
            token_type = token.token_type.as_deref().unwrap_or("unknown"),
            expires_in = ?token.expires_in,
            "Entra ID access token obtained"
        );

        Ok(FederatedAccessToken::new(token.access_token, token.expires_in))
    }
}

const ERROR_BODY_LIMIT: usize = 256;

fn body_excerpt(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        return "empty response body".to_string();
    }
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}

fn redact(message: &str, assertion: &SecretString) -> String {
    let raw = assertion.expose_secret();
    if raw.is_empty() {
        message.to_string()
    } else {
        message.replace(raw.as_str(), "[REDACTED]")
    }
}
