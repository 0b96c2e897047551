//! Owner resolution
//!
//! Pods created by workload controllers share one certificate per top-most
//! controller (a Deployment rather than each of its ReplicaSets' pods). This
//! module climbs a pod's controlling owner references through a whitelist of
//! workload kinds to find that root controller.
//!
//! The climb is iterative and bounded by [`MAX_OWNER_DEPTH`] lookups, one API
//! round trip per level. Nothing is cached between calls.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Owner kinds the resolver is allowed to climb through
pub const CONTROLLER_KINDS: [&str; 6] = [
    "CronJob",
    "DaemonSet",
    "Deployment",
    "Job",
    "ReplicaSet",
    "StatefulSet",
];

/// Upper bound on owner lookups for a single resolution
pub const MAX_OWNER_DEPTH: usize = 8;

/// Read access to the owner references of namespaced cluster objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// Fetch the object `owner` points at and return its own owner references
    ///
    /// Returns `Ok(None)` if the object does not exist.
    async fn owner_references(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Option<Vec<OwnerReference>>, Error>;
}

/// Owner lookups against the Kubernetes API using untyped objects
pub struct KubeOwnerLookup {
    client: Client,
}

impl KubeOwnerLookup {
    /// Create a new lookup wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn owner_references(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<Option<Vec<OwnerReference>>, Error> {
        let (group, version) = split_api_version(&owner.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        let object = api.get_opt(&owner.name).await?;
        Ok(object.map(|o| o.metadata.owner_references.unwrap_or_default()))
    }
}

/// Split `group/version` (or a bare core `version`) into its parts
fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

/// Identity a certificate is issued for
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerIdentity {
    /// `<owner>-<kind>` for controller-owned pods, the pod name otherwise
    pub name: String,
    /// Root controller reference; None when the pod is its own root
    pub owner: Option<OwnerReference>,
}

impl ControllerIdentity {
    /// Identity of a pod with no qualifying controller
    pub fn for_pod(pod_name: &str) -> Self {
        Self {
            name: pod_name.to_string(),
            owner: None,
        }
    }

    /// Identity of a root controller
    pub fn for_owner(owner: OwnerReference) -> Self {
        Self {
            name: controller_name(&owner),
            owner: Some(owner),
        }
    }
}

/// Outcome of climbing an owner chain
#[derive(Clone, Debug, PartialEq)]
pub enum RootOwner {
    /// No qualifying controller reference; the object is its own root
    None,
    /// The top-most qualifying controller
    Controller(OwnerReference),
    /// The first referenced owner no longer exists
    Missing,
}

/// Returns true if `kind` is one of [`CONTROLLER_KINDS`]
pub fn is_controller_kind(kind: &str) -> bool {
    CONTROLLER_KINDS.contains(&kind)
}

/// Name used for certificates issued to a controller: `<name>-<lowercase kind>`
pub fn controller_name(owner: &OwnerReference) -> String {
    format!("{}-{}", owner.name, owner.kind.to_lowercase())
}

/// First reference that is a controller of a whitelisted kind
fn climb_candidate(references: &[OwnerReference]) -> Option<&OwnerReference> {
    references
        .iter()
        .find(|r| r.controller.unwrap_or(false) && is_controller_kind(&r.kind))
}

/// Climb `references` to the top-most qualifying controller that still exists
pub async fn find_root_owner(
    lookup: &dyn OwnerLookup,
    namespace: &str,
    references: &[OwnerReference],
) -> Result<RootOwner, Error> {
    let mut references = references.to_vec();
    let mut root: Option<OwnerReference> = None;
    let mut depth = 0;

    loop {
        let Some(candidate) = climb_candidate(&references).cloned() else {
            return Ok(root.map_or(RootOwner::None, RootOwner::Controller));
        };

        if depth == MAX_OWNER_DEPTH {
            return Err(Error::OwnerChainTooDeep {
                owner: candidate.name,
                depth,
            });
        }
        depth += 1;

        debug!(owner = %candidate.name, kind = %candidate.kind, depth, "Processing owner reference");

        match lookup.owner_references(namespace, &candidate).await? {
            Some(parents) => {
                references = parents;
                root = Some(candidate);
            }
            None => {
                info!(owner = %candidate.name, kind = %candidate.kind, "Owner not found");
                return Ok(root.map_or(RootOwner::Missing, RootOwner::Controller));
            }
        }
    }
}

/// Resolve the controller identity for a pod
///
/// Returns `Ok(None)` when the pod's own controller has disappeared; callers
/// must not derive a certificate from it. A missing ancestor further up stops
/// the climb at the last owner that was found.
pub async fn resolve_controller(
    lookup: &dyn OwnerLookup,
    namespace: &str,
    pod_name: &str,
    references: &[OwnerReference],
) -> Result<Option<ControllerIdentity>, Error> {
    Ok(match find_root_owner(lookup, namespace, references).await? {
        RootOwner::None => Some(ControllerIdentity::for_pod(pod_name)),
        RootOwner::Controller(owner) => Some(ControllerIdentity::for_owner(owner)),
        RootOwner::Missing => None,
    })
}
