//! Pod controller
//!
//! Keeps a cert-manager Certificate in step with every annotated pod's root
//! controller. The Certificate is owned by that controller, or by the pod
//! itself when it has none, so garbage collection removes it with its owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::certificate::{
    sync_certificate, CertificateClient, CertificateRequest, KubeCertificateClient, SyncOutcome,
};
use crate::config::IssuerDefaults;
use crate::owner::{self, KubeOwnerLookup, OwnerLookup};
use crate::Error;

/// Requeue delay after a transient failure
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue delay after a failure that needs outside intervention
pub const PERMANENT_FAILURE_DELAY: Duration = Duration::from_secs(300);

/// Read access to pods
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Get a pod by name, `Ok(None)` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;
}

/// Pod client backed by the Kubernetes API
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Create a new client wrapping the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Controller context shared across reconciles
pub struct Context {
    /// Pod reads
    pub pods: Arc<dyn PodClient>,
    /// Owner chain lookups
    pub owners: Arc<dyn OwnerLookup>,
    /// Certificate reads and writes
    pub certificates: Arc<dyn CertificateClient>,
    /// Issuer used when a pod does not pick one
    pub issuer: IssuerDefaults,
}

impl Context {
    /// Create a context whose clients all talk to the given cluster
    pub fn new(client: Client, issuer: IssuerDefaults) -> Self {
        Self {
            pods: Arc::new(KubePodClient::new(client.clone())),
            owners: Arc::new(KubeOwnerLookup::new(client.clone())),
            certificates: Arc::new(KubeCertificateClient::new(client)),
            issuer,
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        pods: Arc<dyn PodClient>,
        owners: Arc<dyn OwnerLookup>,
        certificates: Arc<dyn CertificateClient>,
        issuer: IssuerDefaults,
    ) -> Self {
        Self {
            pods,
            owners,
            certificates,
            issuer,
        }
    }
}

/// What a reconcile did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pod is gone
    PodNotFound,
    /// The pod is being deleted
    Terminating,
    /// An owner in the pod's chain no longer exists
    OwnerNotFound,
    /// The certificate synchronizer ran
    Certificate(SyncOutcome),
}

/// Reconcile a Pod
///
/// Work is driven purely by pod events, so a successful pass waits for the
/// next change.
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = ?pod.namespace()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let outcome = reconcile_pod(&ctx, &namespace, &pod.name_any()).await?;
    debug!(?outcome, "pod reconciled");
    Ok(Action::await_change())
}

/// Reconcile the pod `namespace/name` against the live cluster state
pub async fn reconcile_pod(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<ReconcileOutcome, Error> {
    let Some(pod) = ctx.pods.get_pod(namespace, name).await? else {
        info!("Could not find Pod");
        return Ok(ReconcileOutcome::PodNotFound);
    };

    if pod.metadata.deletion_timestamp.is_some() {
        info!("Skipping terminating pod");
        return Ok(ReconcileOutcome::Terminating);
    }

    info!("Reconciling Pod");
    let references = pod.metadata.owner_references.as_deref().unwrap_or_default();
    let Some(controller) =
        owner::resolve_controller(ctx.owners.as_ref(), namespace, name, references).await?
    else {
        return Ok(ReconcileOutcome::OwnerNotFound);
    };

    let owner = match controller.owner {
        Some(owner) => owner,
        None => pod_owner_reference(&pod),
    };
    let annotations = pod.metadata.annotations.as_ref();
    let issuer = ctx.issuer.select(annotations);

    let request = CertificateRequest {
        annotations,
        controller_name: &controller.name,
        namespace,
        owner: Some(&owner),
        issuer: &issuer,
    };
    let outcome = sync_certificate(ctx.certificates.as_ref(), &request).await?;
    Ok(ReconcileOutcome::Certificate(outcome))
}

/// Controller reference pointing at the pod itself
pub fn pod_owner_reference(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name_any(),
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Error policy for the pod controller
///
/// Transient failures are retried quickly; anything else waits for a much
/// longer delay or the next pod event.
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        namespace = ?pod.namespace(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::requeue(PERMANENT_FAILURE_DELAY)
    }
}
