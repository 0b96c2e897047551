//! IRA controller - IAM Roles Anywhere credential injection for pods

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ira::config::{
    InjectorConfig, IssuerDefaults, DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_LIMIT,
    DEFAULT_MEMORY_REQUEST, DEFAULT_SESSION_DURATION,
};
use ira::controller;
use ira::crd::CLUSTER_ISSUER_KIND;
use ira::leader_election::{KubeLeaseClient, LeaderElector, LEASE_NAME};
use ira::owner::KubeOwnerLookup;
use ira::server::{start_health_server, start_webhook_server, WebhookServerConfig};
use ira::webhook::WebhookState;

/// IRA - inject IAM Roles Anywhere credential helpers into annotated pods
#[derive(Parser, Debug)]
#[command(name = "ira-controller", version, about, long_about = None)]
struct Cli {
    /// Credential helper image injected as a sidecar
    #[arg(long, env = "CREDENTIAL_HELPER_IMAGE")]
    credential_helper_image: String,

    /// CPU request of the credential helper
    #[arg(long, env = "CREDENTIAL_HELPER_CPU_REQUEST", default_value = DEFAULT_CPU_REQUEST)]
    credential_helper_cpu_request: String,

    /// Memory request of the credential helper
    #[arg(long, env = "CREDENTIAL_HELPER_MEMORY_REQUEST", default_value = DEFAULT_MEMORY_REQUEST)]
    credential_helper_memory_request: String,

    /// CPU limit of the credential helper (empty for none)
    #[arg(long, env = "CREDENTIAL_HELPER_CPU_LIMIT", default_value = "")]
    credential_helper_cpu_limit: String,

    /// Memory limit of the credential helper
    #[arg(long, env = "CREDENTIAL_HELPER_MEMORY_LIMIT", default_value = DEFAULT_MEMORY_LIMIT)]
    credential_helper_memory_limit: String,

    /// Session duration (seconds) requested from IAM Roles Anywhere
    #[arg(
        long,
        env = "CREDENTIAL_HELPER_SESSION_DURATION",
        default_value = DEFAULT_SESSION_DURATION
    )]
    credential_helper_session_duration: String,

    /// Issuer kind used when a pod does not name one (ClusterIssuer or Issuer)
    #[arg(long, env = "DEFAULT_ISSUER_KIND", default_value = CLUSTER_ISSUER_KIND)]
    default_issuer_kind: String,

    /// Issuer name used when a pod does not name one
    #[arg(long, env = "DEFAULT_ISSUER_NAME", default_value = "")]
    default_issuer_name: String,

    /// Run the pod reconciler that creates cert-manager Certificates
    #[arg(long, env = "GENERATE_CERT")]
    generate_cert: bool,

    /// Only run the reconciler on the replica holding the lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Address the health probes bind to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Address the admission webhook binds to
    #[arg(long, env = "WEBHOOK_BIND_ADDRESS", default_value = "0.0.0.0:9443")]
    webhook_bind_address: SocketAddr,

    /// Directory holding the webhook serving certificate (tls.crt, tls.key)
    #[arg(
        long,
        env = "WEBHOOK_CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    webhook_cert_dir: PathBuf,

    /// Serve the webhook over HTTP/2 as well as HTTP/1.1
    #[arg(long, env = "ENABLE_HTTP2")]
    enable_http2: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn injector_config(&self) -> Result<InjectorConfig, ira::Error> {
        InjectorConfig {
            credential_helper_image: self.credential_helper_image.clone(),
            cpu_request: self.credential_helper_cpu_request.clone(),
            memory_request: self.credential_helper_memory_request.clone(),
            cpu_limit: self.credential_helper_cpu_limit.clone(),
            memory_limit: self.credential_helper_memory_limit.clone(),
            session_duration: self.credential_helper_session_duration.clone(),
        }
        .validate()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The webhook server needs a process-wide rustls provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The webhook server cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let injector = Arc::new(
        cli.injector_config()
            .map_err(|e| anyhow::anyhow!("invalid credential helper settings: {e}"))?,
    );
    let issuer = IssuerDefaults::new(&cli.default_issuer_kind, &cli.default_issuer_name)
        .map_err(|e| anyhow::anyhow!("invalid default issuer: {e}"))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let health = tokio::spawn(start_health_server(cli.health_probe_bind_address));

    let webhook = if webhooks_enabled() {
        let state = Arc::new(WebhookState::new(
            Arc::new(KubeOwnerLookup::new(client.clone())),
            injector,
        ));
        let config = WebhookServerConfig {
            addr: cli.webhook_bind_address,
            cert_dir: cli.webhook_cert_dir.clone(),
            enable_http2: cli.enable_http2,
        };
        Some(tokio::spawn(start_webhook_server(config, state)))
    } else {
        tracing::info!("Webhooks disabled via ENABLE_WEBHOOKS=false");
        None
    };

    tokio::select! {
        result = health => server_exited("health probe", result),
        result = wait_webhook(webhook) => server_exited("webhook", result),
        result = run_reconciler(&cli, client, issuer) => {
            result?;
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ira=debug,kube=info"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn webhooks_enabled() -> bool {
    std::env::var("ENABLE_WEBHOOKS").map_or(true, |v| v != "false")
}

async fn wait_webhook(
    handle: Option<JoinHandle<Result<(), ira::Error>>>,
) -> Result<Result<(), ira::Error>, tokio::task::JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn server_exited(
    name: &str,
    result: Result<Result<(), ira::Error>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => Err(anyhow::anyhow!("{name} server stopped unexpectedly")),
        Ok(Err(e)) => Err(anyhow::anyhow!("{name} server failed: {e}")),
        Err(e) => Err(anyhow::anyhow!("{name} server panicked: {e}")),
    }
}

/// Run the pod reconciler if enabled, otherwise wait for a shutdown signal
async fn run_reconciler(cli: &Cli, client: Client, issuer: IssuerDefaults) -> anyhow::Result<()> {
    if !cli.generate_cert {
        tracing::info!("Certificate generation disabled, reconciler not started");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    if !cli.leader_elect {
        controller::run(client, issuer).await;
        return Ok(());
    }

    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let identity = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .map_err(|_| anyhow::anyhow!("POD_NAME or HOSTNAME must be set for leader election"))?;

    let elector = Arc::new(LeaderElector::new(
        Arc::new(KubeLeaseClient::new(client.clone(), &namespace)),
        LEASE_NAME,
        &identity,
    ));
    let mut guard = elector.acquire().await;

    let lost = tokio::select! {
        _ = controller::run(client, issuer) => false,
        _ = guard.lost() => true,
    };

    if lost {
        tracing::error!(identity = %identity, "Leadership lost, exiting");
        std::process::exit(1);
    }

    if let Err(e) = guard.release().await {
        tracing::warn!(error = %e, "Failed to release lease");
    }
    Ok(())
}
