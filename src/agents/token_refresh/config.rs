//! Refresh configuration
//!
//! Built once at startup and handed to the orchestrator. Components never read
//! the environment themselves.

use std::time::Duration;

use super::types::TokenRefreshError;

pub const NAMESPACE_ENV: &str = "ARGOCD_NAMESPACE";
pub const SECRET_NAME_ENV: &str = "ARGOCD_SECRET";
pub const SERVICE_ACCOUNT_ENV: &str = "ARGOCD_SA";

/// Audience Entra ID expects on federated ServiceAccount tokens
pub const TOKEN_EXCHANGE_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Public cloud Entra ID authority
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com/";

/// Configuration for one refresh run
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Namespace holding both the ServiceAccount and the Secret
    pub namespace: String,
    /// Secret whose `password` field receives the access token
    pub secret_name: String,
    /// ServiceAccount to resolve and request a token for
    pub service_account: String,
    /// Audiences for the projected token
    pub audiences: Vec<String>,
    /// Entra ID authority host
    pub authority_host: String,
    /// Optional wall-clock limit for the whole run
    pub timeout: Option<Duration>,
}

impl RefreshConfig {
    /// Validate the three required inputs
    ///
    /// Absent and empty values are both rejected with `ConfigurationMissing`.
    pub fn new(
        namespace: Option<String>,
        secret_name: Option<String>,
        service_account: Option<String>,
    ) -> Result<Self, TokenRefreshError> {
        Ok(Self {
            namespace: required(namespace, NAMESPACE_ENV)?,
            secret_name: required(secret_name, SECRET_NAME_ENV)?,
            service_account: required(service_account, SERVICE_ACCOUNT_ENV)?,
            audiences: vec![TOKEN_EXCHANGE_AUDIENCE.to_string()],
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            timeout: None,
        })
    }

    /// Override the Entra ID authority host (sovereign clouds, tests)
    pub fn authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    /// Cancel the run once this much time has passed
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, TokenRefreshError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(TokenRefreshError::ConfigurationMissing(name))
}
