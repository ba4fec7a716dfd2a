//! Token Refresh Agent - Standalone Binary
//!
//! Exchanges the ServiceAccount's Workload Identity token for an Entra ID
//! access token and stores it as the `password` of an Argo CD repository Secret.
//! Runs one refresh and exits, so it fits a Kubernetes CronJob.
//!
//! ## Usage
//!
//! ```bash
//! # Configuration from the environment (as deployed)
//! ARGOCD_NAMESPACE=argocd ARGOCD_SECRET=repo-creds ARGOCD_SA=argocd-sa token-refresh-agent
//!
//! # Explicit flags, JSON logs, 60 second deadline
//! token-refresh-agent --namespace argocd --secret-name repo-creds \
//!   --service-account argocd-sa --log-format json --timeout-secs 60
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use workload_token_agent::agents::token_refresh::{
    config::DEFAULT_AUTHORITY_HOST, EntraTokenExchanger, KubeIdentityDirectory, KubeSecretStore,
    RefreshConfig, TokenRefresher,
};

/// Token Refresh Agent - Refresh a Secret with an Entra ID token via Workload Identity
#[derive(Parser, Debug)]
#[command(name = "token-refresh-agent", version, about)]
struct Args {
    /// Namespace containing the ServiceAccount and the Secret
    #[arg(long, env = "ARGOCD_NAMESPACE")]
    namespace: Option<String>,

    /// Secret whose `password` field receives the access token
    #[arg(long, env = "ARGOCD_SECRET")]
    secret_name: Option<String>,

    /// ServiceAccount federated with the Entra ID application
    #[arg(long, env = "ARGOCD_SA")]
    service_account: Option<String>,

    /// Entra ID authority host
    #[arg(long, env = "AZURE_AUTHORITY_HOST", default_value = DEFAULT_AUTHORITY_HOST)]
    authority_host: String,

    /// Abort the refresh after this many seconds
    #[arg(long, env = "REFRESH_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "LOG_FORMAT")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    if let Err(err) = run(args).await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }

    println!("Entra ID Token generation completed");
}

async fn run(args: Args) -> Result<()> {
    let mut config = RefreshConfig::new(args.namespace, args.secret_name, args.service_account)?
        .authority_host(args.authority_host);
    if let Some(secs) = args.timeout_secs {
        config = config.timeout(Duration::from_secs(secs));
    }

    info!(
        namespace = %config.namespace,
        service_account = %config.service_account,
        secret = %config.secret_name,
        "Starting Token Refresh Agent"
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let exchanger = EntraTokenExchanger::new(&config.authority_host)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone(), config.timeout));

    let mut refresher = TokenRefresher::new(
        config,
        KubeIdentityDirectory::new(client.clone()),
        exchanger,
        KubeSecretStore::new(client),
    );

    let secret = refresher.run(&cancel).await?;

    info!(
        secret = secret.metadata.name.as_deref().unwrap_or("unknown"),
        resource_version = secret.metadata.resource_version.as_deref().unwrap_or("unknown"),
        "Secret refreshed successfully"
    );

    Ok(())
}

/// Cancel the refresh on Ctrl-C or once the deadline passes
async fn cancel_on_shutdown(cancel: CancellationToken, timeout: Option<Duration>) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => warn!("Interrupt received, cancelling refresh"),
        _ = deadline => warn!("Refresh deadline elapsed, cancelling"),
        _ = cancel.cancelled() => return,
    }

    cancel.cancel();
}

fn init_logging(args: &Args) {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
