//! Agent modules for the Workload Token Agent
//!
//! - `token_refresh`: exchanges a ServiceAccount token for an Entra ID access
//!   token and writes it into a Secret

pub mod token_refresh;
