//! Workload Identity Token Refresh Agent
//!
//! Refreshes the `password` field of a Kubernetes Secret (typically an Argo CD
//! repository credential) with an Entra ID access token for Azure DevOps,
//! obtained through AKS Workload Identity instead of a long-lived PAT.
//!
//! ## Flow
//!
//! 1. **Resolve**: read tenant and client IDs from the ServiceAccount annotations
//! 2. **Fetch**: request a projected token for `api://AzureADTokenExchange`
//! 3. **Exchange**: present it as a client assertion to Entra ID
//! 4. **Publish**: merge-patch the access token into the Secret
//!
//! Each run performs exactly one pass; the first failure ends it. Retrying is
//! left to whatever schedules the agent (usually a CronJob).
//!
//! ## Example Usage
//!
//! ```ignore
//! use workload_token_agent::agents::token_refresh::{
//!     EntraTokenExchanger, KubeIdentityDirectory, KubeSecretStore, RefreshConfig, TokenRefresher,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config = RefreshConfig::new(Some("argocd".into()), Some("repo-creds".into()), Some("argocd-sa".into()))?;
//! let client = kube::Client::try_default().await?;
//! let mut refresher = TokenRefresher::new(
//!     config.clone(),
//!     KubeIdentityDirectory::new(client.clone()),
//!     EntraTokenExchanger::new(&config.authority_host)?,
//!     KubeSecretStore::new(client),
//! );
//! let secret = refresher.run(&CancellationToken::new()).await?;
//! ```

pub mod config;
pub mod exchange;
pub mod identity;
pub mod publisher;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;

use k8s_openapi::api::core::v1::Secret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::RefreshConfig;
pub use exchange::{
    default_scope, AssertionSource, AssertionUnavailable, EntraTokenExchanger, ProjectedAssertion,
    TokenExchanger,
};
pub use identity::{
    fetch_projected_token, resolve_identity, DirectoryError, IdentityDirectory,
    KubeIdentityDirectory,
};
pub use publisher::{publish_access_token, CredentialStore, KubeSecretStore, StoreError};
pub use types::{
    FederatedAccessToken, IdentityBinding, ProjectedToken, RefreshFailure, RefreshState,
    TokenRefreshError,
};

/// One-shot orchestrator for the refresh pipeline
///
/// Moves `Init → Resolving → Fetching → Exchanging → Publishing → Done`, or to
/// `Failed` from whichever stage was in flight.
pub struct TokenRefresher<D, E, S> {
    config: RefreshConfig,
    directory: D,
    exchanger: E,
    store: S,
    state: RefreshState,
}

impl<D, E, S> TokenRefresher<D, E, S>
where
    D: IdentityDirectory,
    E: TokenExchanger,
    S: CredentialStore,
{
    pub fn new(config: RefreshConfig, directory: D, exchanger: E, store: S) -> Self {
        Self {
            config,
            directory,
            exchanger,
            store,
            state: RefreshState::Init,
        }
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    /// Run the pipeline once and return the updated Secret
    ///
    /// Cancelling `cancel` aborts the in-flight call and fails the run with
    /// `TokenRefreshError::Cancelled`.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Secret, RefreshFailure> {
        if self.state != RefreshState::Init {
            return Err(RefreshFailure {
                stage: self.state,
                error: TokenRefreshError::AlreadyRan(self.state),
            });
        }

        let namespace = self.config.namespace.clone();
        let service_account = self.config.service_account.clone();

        info!(
            namespace = %namespace,
            service_account = %service_account,
            secret = %self.config.secret_name,
            "Starting token refresh"
        );

        self.transition(RefreshState::Resolving);
        let result = guarded(
            cancel,
            RefreshState::Resolving,
            resolve_identity(&self.directory, &namespace, &service_account),
        )
        .await;
        let binding = self.check(result)?;

        self.transition(RefreshState::Fetching);
        let result = guarded(
            cancel,
            RefreshState::Fetching,
            fetch_projected_token(
                &self.directory,
                &namespace,
                &service_account,
                &self.config.audiences,
            ),
        )
        .await;
        let projected = self.check(result)?;

        self.transition(RefreshState::Exchanging);
        let assertion = ProjectedAssertion::from(projected);
        let result = guarded(
            cancel,
            RefreshState::Exchanging,
            self.exchanger.exchange(&binding, &assertion),
        )
        .await;
        let access_token = self.check(result)?;

        self.transition(RefreshState::Publishing);
        let result = guarded(
            cancel,
            RefreshState::Publishing,
            publish_access_token(&self.store, &namespace, &self.config.secret_name, &access_token),
        )
        .await;
        let secret = self.check(result)?;

        self.transition(RefreshState::Done);
        info!(secret = %self.config.secret_name, "Token refresh completed");

        Ok(secret)
    }

    fn transition(&mut self, next: RefreshState) {
        debug_assert!(
            !self.state.is_terminal(),
            "no transition out of terminal state {}",
            self.state
        );
        debug!(from = %self.state, to = %next, "Refresh state transition");
        self.state = next;
    }

    fn check<T>(&mut self, result: Result<T, TokenRefreshError>) -> Result<T, RefreshFailure> {
        result.map_err(|error| {
            let stage = self.state;
            warn!(stage = %stage, error = %error, "Token refresh failed");
            self.transition(RefreshState::Failed);
            RefreshFailure { stage, error }
        })
    }
}

/// Race a stage against the cancellation token, preferring cancellation
async fn guarded<T, F>(
    cancel: &CancellationToken,
    stage: RefreshState,
    call: F,
) -> Result<T, TokenRefreshError>
where
    F: Future<Output = Result<T, TokenRefreshError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TokenRefreshError::Cancelled(stage)),
        result = call => result,
    }
}
