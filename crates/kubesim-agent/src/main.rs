//! kubesim-agent - run a fleet of simulated nodes against a cluster

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kubesim_agent::client::connect;
use kubesim_agent::{AgentConfig, KubeClusterClient, Orchestrator};
use kubesim_common::telemetry::{init_telemetry, TelemetryConfig};
use kubesim_common::NODE_LEASE_NAMESPACE;

/// Simulated kubelet fleet for control-plane scale testing
#[derive(Parser, Debug)]
#[command(name = "kubesim-agent", version, about, long_about = None)]
struct Cli {
    /// Number of synthetic nodes to register (1-254)
    #[arg(long, env = "KUBESIM_NODES", default_value_t = 4)]
    nodes: u32,

    /// Kubeconfig of the target cluster; inferred when omitted
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace for node leases
    #[arg(long, env = "KUBESIM_LEASE_NAMESPACE", default_value = NODE_LEASE_NAMESPACE)]
    lease_namespace: String,

    /// Seconds between lease renewals
    #[arg(long, default_value_t = 20)]
    lease_renew_interval_secs: u64,

    /// Capacity of watch event channels and pod work queues
    #[arg(long, default_value_t = 1024)]
    buffer_size: usize,

    /// OTLP collector endpoint for traces
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            node_count: self.nodes,
            lease_namespace: self.lease_namespace.clone(),
            lease_renew_interval: Duration::from_secs(self.lease_renew_interval_secs),
            event_buffer_size: self.buffer_size,
            queue_capacity: self.buffer_size,
            ..Default::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        otlp_endpoint: cli.otlp_endpoint.clone(),
        simulated_nodes: Some(cli.nodes),
        ..Default::default()
    })?;

    let config = cli.agent_config();
    config.validate()?;

    let client = connect(cli.kubeconfig.as_deref()).await?;
    let cluster = Arc::new(KubeClusterClient::new(
        client.clone(),
        config.lease_namespace.clone(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    info!(nodes = config.node_count, "starting kubesim agent");
    let orchestrator = Orchestrator::new(cluster, config);
    match orchestrator.run(client, cancel).await {
        Err(e) if e.is_cancelled() => {
            info!("kubesim agent stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}
