//! Types for the workload identity token refresh
//!
//! Every value here lives for a single refresh run. Token material is held in
//! `SecretString` so it never shows up in `Debug` output or logs.

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Tenant and client identifiers bound to a Kubernetes ServiceAccount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityBinding {
    /// Entra ID tenant (from `azure.workload.identity/tenant-id`)
    pub tenant_id: String,
    /// Application (client) ID (from `azure.workload.identity/client-id`)
    pub client_id: String,
}

/// Short-lived ServiceAccount token scoped to a fixed set of audiences
#[derive(Debug)]
pub struct ProjectedToken {
    token: SecretString,
    audiences: Vec<String>,
}

impl ProjectedToken {
    pub fn new(token: String, audiences: Vec<String>) -> Self {
        Self {
            token: SecretString::new(token),
            audiences,
        }
    }

    /// Audiences the token was requested for, in request order
    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    pub fn into_secret(self) -> SecretString {
        self.token
    }
}

/// Access token issued by Entra ID in exchange for the projected token
#[derive(Debug)]
pub struct FederatedAccessToken {
    access_token: SecretString,
    /// Lifetime hint from the provider, in seconds
    pub expires_in: Option<u64>,
}

impl FederatedAccessToken {
    pub fn new(access_token: String, expires_in: Option<u64>) -> Self {
        Self {
            access_token: SecretString::new(access_token),
            expires_in,
        }
    }

    pub fn expose(&self) -> &str {
        self.access_token.expose_secret()
    }
}

/// States of a single refresh run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Init,
    Resolving,
    Fetching,
    Exchanging,
    Publishing,
    Done,
    Failed,
}

impl RefreshState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RefreshState::Done | RefreshState::Failed)
    }
}

impl std::fmt::Display for RefreshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshState::Init => write!(f, "init"),
            RefreshState::Resolving => write!(f, "resolving"),
            RefreshState::Fetching => write!(f, "fetching"),
            RefreshState::Exchanging => write!(f, "exchanging"),
            RefreshState::Publishing => write!(f, "publishing"),
            RefreshState::Done => write!(f, "done"),
            RefreshState::Failed => write!(f, "failed"),
        }
    }
}

/// Errors that can occur during a token refresh
#[derive(Debug, Error)]
pub enum TokenRefreshError {
    /// A required process input is absent
    #[error("{0} is not set")]
    ConfigurationMissing(&'static str),

    /// The ServiceAccount does not exist
    #[error("service account '{name}' not found in namespace '{namespace}'")]
    NotFound { namespace: String, name: String },

    /// The ServiceAccount lacks one or more workload identity annotations
    #[error("missing annotation {} in service account '{principal}'", quote_all(.annotations))]
    MissingMetadata {
        annotations: Vec<&'static str>,
        principal: String,
    },

    /// The ServiceAccount lookup failed for a reason other than absence
    #[error("failed to look up service account '{principal}': {reason}")]
    LookupFailed { principal: String, reason: String },

    /// The API server refused or failed to issue a projected token
    #[error("token request for service account '{principal}' failed: {reason}")]
    TokenRequestFailed { principal: String, reason: String },

    /// Entra ID rejected or could not complete the exchange
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    /// The Secret patch was not applied
    #[error("failed to patch secret '{secret}': {reason}")]
    PublishFailed { secret: String, reason: String },

    /// The run was cancelled while the given stage was in flight
    #[error("cancelled during {0}")]
    Cancelled(RefreshState),

    /// The orchestrator was asked to run a second time
    #[error("refresh already ran (state: {0})")]
    AlreadyRan(RefreshState),
}

fn quote_all(keys: &[&'static str]) -> String {
    keys.iter()
        .map(|k| format!("'{}'", k))
        .collect::<Vec<_>>()
        .join(", ")
}

/// A refresh run that ended in `Failed`, with the stage that was in flight
#[derive(Debug, Error)]
#[error("{stage} stage failed")]
pub struct RefreshFailure {
    pub stage: RefreshState,
    #[source]
    pub error: TokenRefreshError,
}
