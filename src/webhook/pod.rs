//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pods. Annotated pods get a volume
//! backed by their certificate secret, the metadata endpoint variable on every
//! container, and a long-running credential helper init container.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tracing::{debug, error, info, warn};

use crate::annotations::{self, IdentityAnnotations};
use crate::config::InjectorConfig;
use crate::owner;

use super::WebhookState;

/// Volume holding the issued key pair
pub const CERT_VOLUME_NAME: &str = "ira-cert";
/// Where the key pair is mounted in the helper
pub const CERT_MOUNT_PATH: &str = "/ira-cert";
/// Name of the injected credential helper container
pub const CREDENTIAL_HELPER_NAME: &str = "ira";
/// Credential helper executable
pub const CREDENTIAL_HELPER_COMMAND: &str = "aws_signing_helper";
/// Environment variable pointing SDKs at the helper
pub const METADATA_ENDPOINT_ENV: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";
/// Address the helper serves credentials on
pub const METADATA_ENDPOINT: &str = "http://127.0.0.1:9911";

/// Admission message for pods being deleted
pub const POD_TERMINATING: &str = "pod terminating";
/// Admission message for pods in a terminal phase
pub const POD_FINISHED: &str = "pod finished";

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The request object is not a valid pod
    #[error("invalid pod: {0}")]
    InvalidPod(String),

    /// Resolving the pod's controller failed
    #[error("owner resolution failed: {0}")]
    Owner(#[from] crate::Error),

    /// An error occurred during JSON serialization
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WebhookError {
    /// HTTP status reported in the admission result
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::InvalidPod(_) => StatusCode::BAD_REQUEST,
            WebhookError::Owner(_) | WebhookError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Result of reviewing a pod
#[derive(Debug)]
pub enum PodMutation {
    /// Admitted untouched with an explanatory message
    Skipped(&'static str),
    /// Patch against the submitted pod; empty when nothing changed
    Patch(json_patch::Patch),
}

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(review_pod(&state, &req).await.into_review())
}

/// Turn a pod admission request into a response
pub async fn review_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let Some(object) = &request.object else {
        debug!(uid = %request.uid, "No pod object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    match mutate_pod(state, request.namespace.as_deref(), object).await {
        Ok(PodMutation::Skipped(message)) => {
            let mut response = AdmissionResponse::from(request);
            response.result.code = StatusCode::OK.as_u16();
            response.result.message = message.to_string();
            response
        }
        Ok(PodMutation::Patch(patch)) if patch.0.is_empty() => AdmissionResponse::from(request),
        Ok(PodMutation::Patch(patch)) => {
            debug!(uid = %request.uid, patch_ops = patch.0.len(), "Applying patch to pod");
            match AdmissionResponse::from(request).with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                    deny(
                        request,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("patch serialization error: {e}"),
                    )
                }
            }
        }
        Err(e) => {
            error!(uid = %request.uid, error = %e, "Failed to mutate pod");
            deny(request, e.status_code(), e.to_string())
        }
    }
}

fn deny(
    request: &AdmissionRequest<DynamicObject>,
    status: StatusCode,
    message: String,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = status.as_u16();
    response
}

/// Decide whether and how to mutate a pod
///
/// `namespace` is the request namespace, used when the object itself does not
/// carry one yet.
pub async fn mutate_pod(
    state: &WebhookState,
    namespace: Option<&str>,
    object: &DynamicObject,
) -> Result<PodMutation, WebhookError> {
    let value = serde_json::to_value(object)?;
    let mut pod: Pod =
        serde_json::from_value(value).map_err(|e| WebhookError::InvalidPod(e.to_string()))?;
    let original = serde_json::to_value(&pod)?;

    info!(
        pod = ?pod.metadata.name,
        namespace = ?pod.metadata.namespace,
        generate_name = ?pod.metadata.generate_name,
        "Handling pod admission"
    );

    if pod.metadata.deletion_timestamp.is_some() {
        info!("Skipping terminating pod");
        return Ok(PodMutation::Skipped(POD_TERMINATING));
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if matches!(phase, Some("Succeeded" | "Failed")) {
        info!("Skipping finished pod");
        return Ok(PodMutation::Skipped(POD_FINISHED));
    }

    let pod_annotations = pod.metadata.annotations.clone();
    if let Some(identity) = IdentityAnnotations::from_annotations(pod_annotations.as_ref()) {
        if is_injected(&pod) {
            debug!("Credential helper already present");
        } else {
            let namespace = pod
                .metadata
                .namespace
                .as_deref()
                .or(namespace)
                .unwrap_or_default()
                .to_string();
            // Unset for generateName pods at admission time
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            let references = pod.metadata.owner_references.clone().unwrap_or_default();

            match owner::resolve_controller(
                state.owners.as_ref(),
                &namespace,
                &pod_name,
                &references,
            )
            .await?
            {
                Some(controller) => {
                    if controller.owner.is_none() && pod_name.is_empty() {
                        warn!(
                            generate_name = ?pod.metadata.generate_name,
                            "Pod has neither a name nor a controller, its secret will not match a certificate"
                        );
                    }
                    let cert_name =
                        annotations::cert_name(pod_annotations.as_ref(), &controller.name);
                    let trailing_slash =
                        annotations::wants_trailing_slash(pod_annotations.as_ref());
                    inject_credentials(
                        &mut pod,
                        &identity,
                        &cert_name,
                        trailing_slash,
                        &state.config,
                    );
                    info!(pod = %pod_name, certificate = %cert_name, "Attempting to patch pod");
                }
                None => debug!(pod = %pod_name, "Owner chain broken, admitting pod unmutated"),
            }
        }
    }

    let mutated = serde_json::to_value(&pod)?;
    Ok(PodMutation::Patch(json_patch::diff(&original, &mutated)))
}

fn is_injected(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.init_containers.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.name == CREDENTIAL_HELPER_NAME))
}

/// Add the certificate volume, metadata endpoint and credential helper to a pod
pub fn inject_credentials(
    pod: &mut Pod,
    identity: &IdentityAnnotations<'_>,
    cert_name: &str,
    trailing_slash: bool,
    config: &InjectorConfig,
) {
    let spec = pod.spec.get_or_insert_with(Default::default);

    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: CERT_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(cert_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });

    let endpoint = if trailing_slash {
        format!("{METADATA_ENDPOINT}/")
    } else {
        METADATA_ENDPOINT.to_string()
    };
    for container in &mut spec.containers {
        container.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: METADATA_ENDPOINT_ENV.to_string(),
            value: Some(endpoint.clone()),
            value_from: None,
        });
    }

    spec.init_containers
        .get_or_insert_with(Vec::new)
        .push(credential_helper(identity, config));
}

/// The credential helper container for an identity
pub fn credential_helper(
    identity: &IdentityAnnotations<'_>,
    config: &InjectorConfig,
) -> Container {
    let args = vec![
        "serve".to_string(),
        "--certificate".to_string(),
        format!("{CERT_MOUNT_PATH}/tls.crt"),
        "--private-key".to_string(),
        format!("{CERT_MOUNT_PATH}/tls.key"),
        "--trust-anchor-arn".to_string(),
        identity.trust_anchor.to_string(),
        "--profile-arn".to_string(),
        identity.profile.to_string(),
        "--role-arn".to_string(),
        identity.role.to_string(),
        format!("--session-duration={}", config.session_duration),
    ];

    Container {
        name: CREDENTIAL_HELPER_NAME.to_string(),
        image: Some(config.credential_helper_image.clone()),
        command: Some(vec![CREDENTIAL_HELPER_COMMAND.to_string()]),
        args: Some(args),
        restart_policy: Some("Always".to_string()),
        resources: Some(credential_helper_resources(config)),
        volume_mounts: Some(vec![VolumeMount {
            name: CERT_VOLUME_NAME.to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Requests and limits for the helper; each is set only if configured
pub fn credential_helper_resources(config: &InjectorConfig) -> ResourceRequirements {
    fn quantities(entries: [(&str, &str); 2]) -> Option<BTreeMap<String, Quantity>> {
        let map: BTreeMap<String, Quantity> = entries
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.to_string(), Quantity(value.to_string())))
            .collect();
        (!map.is_empty()).then_some(map)
    }

    ResourceRequirements {
        requests: quantities([
            ("cpu", &config.cpu_request),
            ("memory", &config.memory_request),
        ]),
        limits: quantities([("cpu", &config.cpu_limit), ("memory", &config.memory_limit)]),
        ..Default::default()
    }
}
