//! Lease-based leader election.
//!
//! One `coordination.k8s.io/v1` lease serialises the fleet: a replica
//! acquires it (or takes it over once expired), renews it on a fixed period,
//! and surrenders by returning from [`LeaderElection::lead`] when renewal
//! keeps failing past the deadline. The caller exits the process on loss;
//! there is no re-acquisition in-process.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client,
};
use rand::distr::{Alphanumeric, SampleString};
use tokio::time::Instant;
use tracing::{debug, warn};

pub(crate) struct LeaderElection {
    api: Api<Lease>,
    name: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
}

impl LeaderElection {
    pub(crate) fn new(
        client: &Client,
        namespace: &str,
        name: String,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        let identity = format!(
            "handover-{}",
            Alphanumeric.sample_string(&mut rand::rng(), 10).to_lowercase(),
        );
        Self {
            api: Api::namespaced(client.clone(), namespace),
            name,
            identity,
            lease_duration,
            renew_deadline,
            retry_period,
        }
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    /// Blocks until this replica holds the lease.
    pub(crate) async fn acquire(&self) -> Result<(), kube::Error> {
        loop {
            match self.try_acquire().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(lease = %self.name, "lease held elsewhere; retrying"),
                Err(error) => warn!(%error, "failed to contend for the leader lease"),
            }
            tokio::time::sleep(self.retry_period).await;
        }
    }

    /// Renews until renewal has been failing for longer than the deadline,
    /// then returns. Leadership is gone at that point.
    pub(crate) async fn lead(self) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(self.retry_period).await;
            match self.renew().await {
                Ok(()) => last_renewed = Instant::now(),
                Err(error) => {
                    warn!(%error, "failed to renew the leader lease");
                    if last_renewed.elapsed() > self.renew_deadline {
                        return;
                    }
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let Some(existing) = self.api.get_opt(&self.name).await? else {
            return match self
                .api
                .create(&PostParams::default(), &self.fresh_lease(0))
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                Err(error) => Err(error),
            };
        };

        let spec = existing.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() == Some(&self.identity) {
            return Ok(true);
        }
        if !lease_expired(&spec, self.lease_duration) {
            return Ok(false);
        }

        // Expired: take it over, with the resource version as the tiebreak
        // between contending replicas.
        let transitions = spec.lease_transitions.unwrap_or_default() + 1;
        let mut lease = self.fresh_lease(transitions);
        lease.metadata.resource_version = existing.metadata.resource_version.clone();
        match self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn renew(&self) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": self.lease_duration.as_secs(),
                "renewTime": MicroTime(Utc::now()),
            }
        });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    fn fresh_lease(&self, transitions: i32) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

fn lease_expired(spec: &LeaseSpec, fallback_duration: Duration) -> bool {
    let Some(renew_time) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .map(|seconds| Duration::from_secs(seconds.max(0) as u64))
        .unwrap_or(fallback_duration);
    let age = Utc::now().signed_duration_since(renew_time.0);
    age.to_std().map(|age| age > duration).unwrap_or(false)
}
