//! Workload Token Agent Library
//!
//! Refreshes Kubernetes-held credentials with Entra ID tokens obtained through
//! AKS Workload Identity federation.

pub mod agents;

pub use agents::token_refresh::{RefreshConfig, TokenRefresher};
