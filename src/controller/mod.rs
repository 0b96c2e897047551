//! Pod controller
//!
//! Watches every pod in the cluster and keeps the Certificate behind each
//! annotated pod's identity converged. Delivery, deduplication and backoff come
//! from `kube::runtime`.

mod pod;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use crate::config::IssuerDefaults;

pub use pod::{
    error_policy, pod_owner_reference, reconcile, reconcile_pod, Context, KubePodClient,
    PodClient, ReconcileOutcome, PERMANENT_FAILURE_DELAY, RETRY_DELAY,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Run the pod controller until a shutdown signal arrives
pub async fn run(client: Client, issuer: IssuerDefaults) {
    let ctx = Arc::new(Context::new(client.clone(), issuer));
    let pods: Api<Pod> = Api::all(client);

    tracing::info!("Starting pod controller");

    Controller::new(pods, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((pod, action)) => {
                    tracing::debug!(pod = %pod, ?action, "Pod reconciliation completed")
                }
                Err(e) => tracing::error!(error = ?e, "Pod reconciliation error"),
            }
            std::future::ready(())
        })
        .await;
}
