//! The four cooperating reconcilers that migrate machine authority between
//! the paired APIs.
//!
//! Sync engines keep the mirrors equivalent in the direction dictated by the
//! observed authority; migration engines drive the authority hand-off state
//! machine. All four operate on the same logical pair, keyed by the legacy
//! resource's name, and share the status-writing, direction, and lifecycle
//! libraries in this crate.

use std::sync::Arc;

use handover_convert::Converter;
use kube::{runtime::events::{Recorder, Reporter}, Client};
use tokio_util::sync::CancellationToken;

pub mod direction;
pub mod error;
pub mod migration;
pub mod status;
pub mod sync;

pub use error::{ControllerError, Result};

/// Dependencies shared by every reconciler, built once at startup.
pub struct Context {
    pub client: Client,
    /// Namespace of the legacy mirrors.
    pub legacy_namespace: String,
    /// Namespace of the modern mirrors, their templates, and the cluster
    /// object.
    pub modern_namespace: String,
    /// Name of the per-cluster `Cluster` object owning all modern mirrors.
    pub cluster_name: String,
    pub converter: Converter,
    recorder: Recorder,
}

impl Context {
    pub fn new(
        client: Client,
        legacy_namespace: String,
        modern_namespace: String,
        cluster_name: String,
        converter: Converter,
    ) -> Self {
        let reporter: Reporter = "handover-controller".into();
        let recorder = Recorder::new(client.clone(), reporter);
        Self {
            client,
            legacy_namespace,
            modern_namespace,
            cluster_name,
            converter,
            recorder,
        }
    }

    pub(crate) fn recorder(&self) -> &Recorder {
        &self.recorder
    }
}

/// Runs all four controllers until `shutdown` fires, then drains in-flight
/// reconciles.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    tokio::join!(
        sync::machine::run(ctx.clone(), shutdown.clone()),
        sync::machine_set::run(ctx.clone(), shutdown.clone()),
        migration::machine::run(ctx.clone(), shutdown.clone()),
        migration::machine_set::run(ctx, shutdown),
    );
}
