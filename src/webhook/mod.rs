//! Mutating admission webhook
//!
//! Intercepts pod create/update requests and injects the credential helper
//! sidecar, its certificate volume and the metadata endpoint environment into
//! pods that carry identity annotations.

pub mod pod;

use std::sync::Arc;

use axum::{routing::post, Router};

use crate::config::InjectorConfig;
use crate::owner::OwnerLookup;

/// Path the API server posts pod admission reviews to
pub const MUTATE_POD_PATH: &str = "/mutate-core-v1-pod";

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Owner lookups for resolving the controller identity
    pub owners: Arc<dyn OwnerLookup>,
    /// Credential helper settings
    pub config: Arc<InjectorConfig>,
}

impl WebhookState {
    /// Create a new webhook state
    pub fn new(owners: Arc<dyn OwnerLookup>, config: Arc<InjectorConfig>) -> Self {
        Self { owners, config }
    }
}

/// Create the webhook router
///
/// - POST /mutate-core-v1-pod - Inject credentials into annotated pods
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_POD_PATH, post(pod::mutate_handler))
        .with_state(state)
}
