//! Process entrypoint: flag parsing, logging, and the startup sequence that
//! gates the controllers on cluster configuration.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod health;
mod leader;
mod startup;

#[derive(Debug, Parser)]
#[command(name = "handover", about, version)]
pub(crate) struct Cli {
    /// Address the health probe endpoints bind to.
    #[arg(long, default_value = "0.0.0.0:9440")]
    pub health_probe_bind_address: String,

    /// Address the diagnostics (metrics) endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub metrics_bind_address: String,

    /// Namespace holding the legacy mirrors.
    #[arg(long, default_value = "machine-api")]
    pub legacy_namespace: String,

    /// Namespace holding the modern mirrors, templates, and the cluster
    /// object.
    #[arg(long, default_value = "cluster-api")]
    pub modern_namespace: String,

    /// Log to stderr instead of stdout.
    #[arg(long)]
    pub logtostderr: bool,

    /// Enable leader election; exactly one replica reconciles at a time.
    #[arg(long)]
    pub leader_elect: bool,

    /// Name of the leader election lease.
    #[arg(long, default_value = "handover-leader")]
    pub leader_elect_resource_name: String,

    /// Namespace of the leader election lease.
    #[arg(long, default_value = "kube-system")]
    pub leader_elect_resource_namespace: String,

    /// Duration non-leaders wait before trying to take an expired lease,
    /// in seconds.
    #[arg(long, default_value_t = 137)]
    pub leader_elect_lease_duration: u64,

    /// How long the leader keeps retrying a failing renewal before giving
    /// up leadership, in seconds.
    #[arg(long, default_value_t = 107)]
    pub leader_elect_renew_deadline: u64,

    /// Interval between renewal attempts, in seconds.
    #[arg(long, default_value_t = 26)]
    pub leader_elect_retry_period: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.logtostderr);

    match startup::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "exiting");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logtostderr: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logtostderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}
