//! Certificate synchronization
//!
//! Computes the desired cert-manager Certificate for a controller identity and
//! drives the cluster to it with a get, then create or full replace. Only the
//! resourceVersion of an existing object is carried forward: the computed spec
//! is the source of truth and hand edits to the Certificate are overwritten on
//! every reconcile. Concurrent writers are arbitrated by optimistic concurrency
//! at the API server; a stale write surfaces as a 409 and the pod is requeued.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::annotations::{self, Annotations, IssuerSelection};
use crate::crd::{
    Certificate, CertificatePrivateKey, CertificateSpec, IssuerRef, PrivateKeyAlgorithm,
    CERT_MANAGER_GROUP,
};
use crate::Error;

/// Longest common name accepted in an X.509 subject
pub const COMMON_NAME_MAX_LEN: usize = 64;

/// RSA key size for issued certificates
pub const PRIVATE_KEY_SIZE: u32 = 8192;

/// Access to cert-manager Certificates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateClient: Send + Sync {
    /// Get a Certificate by name, `Ok(None)` if it does not exist
    async fn get_certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Certificate>, Error>;

    /// Create a Certificate
    async fn create_certificate(
        &self,
        namespace: &str,
        certificate: &Certificate,
    ) -> Result<(), Error>;

    /// Replace an existing Certificate; `metadata.resourceVersion` must be set
    async fn replace_certificate(
        &self,
        namespace: &str,
        certificate: &Certificate,
    ) -> Result<(), Error>;
}

/// Certificate client backed by the Kubernetes API
pub struct KubeCertificateClient {
    client: Client,
}

impl KubeCertificateClient {
    /// Create a new client wrapping the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Certificate> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl CertificateClient for KubeCertificateClient {
    async fn get_certificate(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Certificate>, Error> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create_certificate(
        &self,
        namespace: &str,
        certificate: &Certificate,
    ) -> Result<(), Error> {
        self.api(namespace)
            .create(&PostParams::default(), certificate)
            .await?;
        Ok(())
    }

    async fn replace_certificate(
        &self,
        namespace: &str,
        certificate: &Certificate,
    ) -> Result<(), Error> {
        self.api(namespace)
            .replace(&certificate.name_any(), &PostParams::default(), certificate)
            .await?;
        Ok(())
    }
}

/// Inputs for a single certificate synchronization
#[derive(Clone, Debug)]
pub struct CertificateRequest<'a> {
    /// Annotations of the pod that triggered the sync
    pub annotations: Option<&'a Annotations>,
    /// Controller identity name (see [`crate::owner::ControllerIdentity`])
    pub controller_name: &'a str,
    /// Namespace of the pod and certificate
    pub namespace: &'a str,
    /// Owner attached to the certificate
    pub owner: Option<&'a OwnerReference>,
    /// Issuer signing the certificate
    pub issuer: &'a IssuerSelection,
}

/// What a sync did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pod does not carry identity annotations
    Skipped,
    /// No certificate existed and one was created
    Created,
    /// An existing certificate was replaced with the desired state
    Updated,
}

/// `<namespace>/<controller>`, cut to [`COMMON_NAME_MAX_LEN`] characters
pub fn common_name(namespace: &str, controller_name: &str) -> String {
    format!("{namespace}/{controller_name}")
        .chars()
        .take(COMMON_NAME_MAX_LEN)
        .collect()
}

/// Build the desired Certificate for a request
///
/// Pure: the same request always yields an identical object.
pub fn desired_certificate(request: &CertificateRequest<'_>) -> Certificate {
    let name = annotations::cert_name(request.annotations, request.controller_name);

    Certificate {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(request.namespace.to_string()),
            owner_references: request.owner.map(|owner| vec![owner.clone()]),
            ..Default::default()
        },
        spec: CertificateSpec {
            common_name: Some(common_name(request.namespace, request.controller_name)),
            issuer_ref: IssuerRef {
                name: request.issuer.name.clone(),
                kind: request.issuer.kind.clone(),
                group: CERT_MANAGER_GROUP.to_string(),
            },
            secret_name: name,
            private_key: Some(CertificatePrivateKey {
                algorithm: PrivateKeyAlgorithm::Rsa,
                size: PRIVATE_KEY_SIZE,
            }),
        },
    }
}

/// Create or replace the Certificate for a request
///
/// Errors from the client are returned unchanged so the caller can requeue.
pub async fn sync_certificate(
    client: &dyn CertificateClient,
    request: &CertificateRequest<'_>,
) -> Result<SyncOutcome, Error> {
    if !annotations::has_identity(request.annotations) {
        info!("Skipping unannotated resource");
        return Ok(SyncOutcome::Skipped);
    }

    info!(controller = %request.controller_name, "Found resource with annotations");

    let mut certificate = desired_certificate(request);
    let name = certificate.metadata.name.clone().unwrap_or_default();

    match client.get_certificate(request.namespace, &name).await? {
        None => {
            info!(certificate = %name, "Cert doesn't exist: creating");
            client
                .create_certificate(request.namespace, &certificate)
                .await?;
            Ok(SyncOutcome::Created)
        }
        Some(existing) => {
            info!(
                certificate = %name,
                resource_version = ?existing.metadata.resource_version,
                "Found certificate"
            );
            certificate.metadata.resource_version = existing.metadata.resource_version;
            client
                .replace_certificate(request.namespace, &certificate)
                .await?;
            debug!(certificate = %name, "certificate replaced");
            Ok(SyncOutcome::Updated)
        }
    }
}
