//! Leader election using Kubernetes Leases
//!
//! Only one replica runs the pod controller at a time. Replicas compete for a
//! coordination.k8s.io/v1 Lease; the holder renews it periodically and anyone
//! may take it over once it has expired.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion that was read. If the lease changed
//! in between, the write fails with 409 Conflict and the attempt counts as
//! lost, so two replicas can never both believe they hold the lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::is_conflict;
use crate::Error;

/// Lease name for the controller, shared with earlier releases so upgrades
/// never run two leaders
pub const LEASE_NAME: &str = "fe237894.ontsys.com";

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Lease reads and writes in a single namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Get a lease by name, `Ok(None)` if it does not exist
    async fn get_lease(&self, name: &str) -> Result<Option<Lease>, Error>;

    /// Create a lease
    async fn create_lease(&self, lease: &Lease) -> Result<(), Error>;

    /// Replace a lease; fails with 409 if its resourceVersion is stale
    async fn replace_lease(&self, name: &str, lease: &Lease) -> Result<(), Error>;
}

/// Lease client backed by the Kubernetes API
pub struct KubeLeaseClient {
    api: Api<Lease>,
}

impl KubeLeaseClient {
    /// Create a client for leases in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn get_lease(&self, name: &str) -> Result<Option<Lease>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<(), Error> {
        self.api.create(&PostParams::default(), lease).await?;
        Ok(())
    }

    async fn replace_lease(&self, name: &str, lease: &Lease) -> Result<(), Error> {
        self.api.replace(name, &PostParams::default(), lease).await?;
        Ok(())
    }
}

/// What to do with the lease as it was last read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// Someone else held it but it expired
    TakeOver {
        /// Transition count recorded on the lease
        transitions: i32,
    },
    /// Held by someone else and still valid
    Wait,
}

/// Decide how to treat the lease for `identity` at time `now`
pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => {
            now > rt.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    };

    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    leases: Arc<dyn LeaseClient>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (15s lease, 5s renew, 2s retry)
    pub fn new(leases: Arc<dyn LeaseClient>, lease_name: &str, identity: &str) -> Self {
        Self {
            leases,
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Override lease timing
    pub fn with_timing(
        mut self,
        lease_duration: Duration,
        renew: Duration,
        retry: Duration,
    ) -> Self {
        self.lease_duration = lease_duration;
        self.renew_interval = renew;
        self.retry_interval = retry;
        self
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease in the background.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One election round; true if we hold the lease afterwards
    pub async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let now = Utc::now();
        let existing = self.leases.get_lease(&self.lease_name).await?;

        let result = match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => {
                let lease = self.lease(None, now, 0);
                self.leases.create_lease(&lease).await
            }
            LeaseAction::Renew => {
                let mut lease = existing.unwrap_or_default();
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.leases.replace_lease(&self.lease_name, &lease).await
            }
            LeaseAction::TakeOver { transitions } => {
                let Some(version) = existing.and_then(|l| l.metadata.resource_version) else {
                    return Err(Error::internal("lease missing resourceVersion"));
                };
                let lease = self.lease(Some(version), now, transitions + 1);
                let result = self.leases.replace_lease(&self.lease_name, &lease).await;
                if result.is_ok() {
                    info!(
                        identity = %self.identity,
                        transitions = transitions + 1,
                        "Took over expired lease"
                    );
                }
                result
            }
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(
                    i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Give up the lease so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), Error> {
        let Some(mut lease) = self.leases.get_lease(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        self.leases.replace_lease(&self.lease_name, &lease).await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder
    pub async fn release(&self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        debug!(identity = %self.elector.identity, "Leader guard dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn held_by(identity: &str, renewed: DateTime<Utc>, version: &str) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(3),
                ..Default::default()
            }),
        }
    }

    fn elector(leases: MockLeaseClient) -> LeaderElector {
        LeaderElector::new(Arc::new(leases), LEASE_NAME, "ira-0")
    }

    #[test]
    fn test_lease_name_is_stable_across_releases() {
        assert_eq!(LEASE_NAME, "fe237894.ontsys.com");
    }

    #[test]
    fn test_lease_action_decisions() {
        let now = Utc::now();
        assert_eq!(lease_action(None, "ira-0", now), LeaseAction::Create);

        let mine = held_by("ira-0", now - chrono::Duration::seconds(60), "1");
        assert_eq!(lease_action(Some(&mine), "ira-0", now), LeaseAction::Renew);

        let fresh = held_by("ira-1", now, "1");
        assert_eq!(lease_action(Some(&fresh), "ira-0", now), LeaseAction::Wait);

        let stale = held_by("ira-1", now - chrono::Duration::seconds(16), "1");
        assert_eq!(
            lease_action(Some(&stale), "ira-0", now),
            LeaseAction::TakeOver { transitions: 3 }
        );

        let empty = Lease::default();
        assert_eq!(
            lease_action(Some(&empty), "ira-0", now),
            LeaseAction::TakeOver { transitions: 0 }
        );
    }

    #[tokio::test]
    async fn test_first_replica_creates_lease() {
        let mut leases = MockLeaseClient::new();
        leases.expect_get_lease().returning(|_| Ok(None));
        leases
            .expect_create_lease()
            .withf(|l| {
                let spec = l.spec.as_ref().unwrap();
                l.metadata.name.as_deref() == Some(LEASE_NAME)
                    && spec.holder_identity.as_deref() == Some("ira-0")
                    && spec.lease_transitions == Some(0)
            })
            .times(1)
            .returning(|_| Ok(()));

        assert!(elector(leases).try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_holder_renews_with_read_version() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get_lease()
            .returning(|_| Ok(Some(held_by("ira-0", Utc::now(), "41"))));
        leases
            .expect_replace_lease()
            .withf(|_, l| l.metadata.resource_version.as_deref() == Some("41"))
            .times(1)
            .returning(|_, _| Ok(()));

        assert!(elector(leases).try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_valid_foreign_lease_is_left_alone() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get_lease()
            .returning(|_| Ok(Some(held_by("ira-1", Utc::now(), "7"))));
        leases.expect_replace_lease().never();
        leases.expect_create_lease().never();

        assert!(!elector(leases).try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let mut leases = MockLeaseClient::new();
        leases.expect_get_lease().returning(|_| {
            Ok(Some(held_by(
                "ira-1",
                Utc::now() - chrono::Duration::seconds(120),
                "7",
            )))
        });
        leases
            .expect_replace_lease()
            .withf(|_, l| {
                let spec = l.spec.as_ref().unwrap();
                l.metadata.resource_version.as_deref() == Some("7")
                    && spec.holder_identity.as_deref() == Some("ira-0")
                    && spec.lease_transitions == Some(4)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        assert!(elector(leases).try_acquire_or_renew().await.unwrap());
    }

    /// Story: two replicas race for an expired lease and only one wins
    #[tokio::test]
    async fn story_takeover_race_loser_backs_off() {
        let mut leases = MockLeaseClient::new();
        leases.expect_get_lease().returning(|_| {
            Ok(Some(held_by(
                "ira-1",
                Utc::now() - chrono::Duration::seconds(120),
                "7",
            )))
        });
        leases
            .expect_replace_lease()
            .returning(|_, _| Err(api_error(409, "Conflict").into()));

        assert!(!elector(leases).try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_race_is_not_an_error() {
        let mut leases = MockLeaseClient::new();
        leases.expect_get_lease().returning(|_| Ok(None));
        leases
            .expect_create_lease()
            .returning(|_| Err(api_error(409, "AlreadyExists").into()));

        assert!(!elector(leases).try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_api_errors_propagate() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get_lease()
            .returning(|_| Err(api_error(403, "Forbidden").into()));

        let err = elector(leases).try_acquire_or_renew().await.unwrap_err();
        assert!(matches!(err, Error::Kube(_)));
    }

    /// Story: a replica whose lease is taken over is told it lost leadership
    #[tokio::test]
    async fn story_guard_signals_lost_leadership() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut leases = MockLeaseClient::new();
        let counter = calls.clone();
        leases.expect_get_lease().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(held_by("ira-1", Utc::now(), "9")))
            }
        });
        leases.expect_create_lease().returning(|_| Ok(()));

        let elector = Arc::new(elector(leases).with_timing(
            Duration::from_secs(15),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));
        let mut guard = elector.acquire().await;

        tokio::time::timeout(Duration::from_secs(5), guard.lost())
            .await
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_release_clears_holder() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get_lease()
            .returning(|_| Ok(Some(held_by("ira-0", Utc::now(), "12"))));
        leases
            .expect_replace_lease()
            .withf(|_, l| {
                let spec = l.spec.as_ref().unwrap();
                spec.holder_identity.is_none()
                    && l.metadata.resource_version.as_deref() == Some("12")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        elector(leases).release_lease().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_skips_foreign_lease() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get_lease()
            .returning(|_| Ok(Some(held_by("ira-1", Utc::now(), "12"))));
        leases.expect_replace_lease().never();

        elector(leases).release_lease().await.unwrap();
    }
}
