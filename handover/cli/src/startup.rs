//! The startup sequence: feature gates, platform detection, leader election,
//! and controller launch.
//!
//! Two of the exit paths idle instead of failing: a disabled migration
//! feature and an unsupported platform both mean "this cluster does not want
//! these controllers", and the process parks until signalled so the
//! deployment stays green.

use std::{sync::Arc, time::Duration};

use handover_api::config::{
    FeatureGate, Infrastructure, CLUSTER_SINGLETON, MIGRATION_FEATURE, VSPHERE_MIGRATION_FEATURE,
};
use handover_controllers::Context;
use handover_convert::{Converter, Platform};
use kube::{Api, Client};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{health, leader, Cli};

/// How long the feature gate gets to show up and resolve before startup
/// fails.
const FEATURE_GATE_TIMEOUT: Duration = Duration::from_secs(60);
const FEATURE_GATE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub(crate) enum StartupError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("feature gate {CLUSTER_SINGLETON} not initialised within {FEATURE_GATE_TIMEOUT:?}")]
    FeatureGateTimeout,

    #[error("infrastructure object {CLUSTER_SINGLETON} not found")]
    InfrastructureMissing,

    #[error("infrastructure object carries no infrastructure name")]
    ClusterNameMissing,

    #[error("invalid bind address {address}: {source}")]
    BindAddress {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("leader lease could not be renewed within the deadline")]
    LeadershipLost,
}

pub(crate) async fn run(cli: Cli) -> Result<(), StartupError> {
    let client = Client::try_default().await?;

    let gate = wait_for_feature_gate(&client).await?;
    if !gate.enabled(MIGRATION_FEATURE) {
        info!("machine authority migration is disabled; idling until signalled");
        return idle_until_signal().await;
    }

    let infrastructure = Api::<Infrastructure>::all(client.clone())
        .get_opt(CLUSTER_SINGLETON)
        .await?
        .ok_or(StartupError::InfrastructureMissing)?;
    let Some(platform) = Platform::from_infrastructure(&infrastructure) else {
        warn!(
            platform = infrastructure.platform().unwrap_or("<unset>"),
            "unsupported platform; idling until signalled",
        );
        return idle_until_signal().await;
    };
    if platform.gated_separately() && !gate.enabled(VSPHERE_MIGRATION_FEATURE) {
        info!(%platform, "platform-specific migration gate is disabled; idling until signalled");
        return idle_until_signal().await;
    }
    let cluster_name = infrastructure
        .infrastructure_name()
        .ok_or(StartupError::ClusterNameMissing)?
        .to_string();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let probe_address = cli
        .health_probe_bind_address
        .parse()
        .map_err(|source| StartupError::BindAddress {
            address: cli.health_probe_bind_address.clone(),
            source,
        })?;
    let metrics_address =
        cli.metrics_bind_address
            .parse()
            .map_err(|source| StartupError::BindAddress {
                address: cli.metrics_bind_address.clone(),
                source,
            })?;
    tokio::spawn(health::serve(
        probe_address,
        health::Endpoint::Probes,
        shutdown.clone(),
    ));
    tokio::spawn(health::serve(
        metrics_address,
        health::Endpoint::Metrics,
        shutdown.clone(),
    ));

    let election = cli.leader_elect.then(|| {
        leader::LeaderElection::new(
            &client,
            &cli.leader_elect_resource_namespace,
            cli.leader_elect_resource_name.clone(),
            Duration::from_secs(cli.leader_elect_lease_duration),
            Duration::from_secs(cli.leader_elect_renew_deadline),
            Duration::from_secs(cli.leader_elect_retry_period),
        )
    });
    if let Some(election) = election.as_ref() {
        election.acquire().await?;
        info!(identity = election.identity(), "acquired leadership");
    }

    info!(
        %platform,
        cluster = %cluster_name,
        legacy_namespace = %cli.legacy_namespace,
        modern_namespace = %cli.modern_namespace,
        "starting controllers",
    );
    let ctx = Arc::new(Context::new(
        client,
        cli.legacy_namespace,
        cli.modern_namespace,
        cluster_name,
        Converter::new(platform),
    ));

    match election {
        None => {
            handover_controllers::run(ctx, shutdown).await;
            Ok(())
        }
        Some(election) => {
            tokio::select! {
                () = handover_controllers::run(ctx, shutdown.clone()) => Ok(()),
                () = election.lead() => {
                    shutdown.cancel();
                    Err(StartupError::LeadershipLost)
                }
            }
        }
    }
}

async fn wait_for_feature_gate(client: &Client) -> Result<FeatureGate, StartupError> {
    let api = Api::<FeatureGate>::all(client.clone());
    let deadline = tokio::time::Instant::now() + FEATURE_GATE_TIMEOUT;

    loop {
        match api.get_opt(CLUSTER_SINGLETON).await {
            Ok(Some(gate)) if gate.initialized() => return Ok(gate),
            Ok(_) => info!("waiting for the feature gate to resolve"),
            Err(error) => warn!(%error, "failed to read the feature gate"),
        }
        if tokio::time::Instant::now() + FEATURE_GATE_POLL > deadline {
            return Err(StartupError::FeatureGateTimeout);
        }
        tokio::time::sleep(FEATURE_GATE_POLL).await;
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<(), std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("received shutdown signal");
        shutdown.cancel();
    });
    Ok(())
}

/// Parks the process until SIGINT or SIGTERM; used when the cluster
/// configuration turns the controllers off. Exits zero.
async fn idle_until_signal() -> Result<(), StartupError> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
