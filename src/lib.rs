//! IRA - IAM Roles Anywhere credentials for Kubernetes pods
//!
//! Pods opt in with annotations naming a Roles Anywhere trust anchor, profile
//! and role. A mutating admission webhook injects a credential helper sidecar
//! that exchanges an X.509 certificate for short-lived AWS credentials, and an
//! optional controller keeps a cert-manager Certificate in sync with each
//! annotated pod's root controller so the helper has a key pair to use.
//!
//! # Modules
//!
//! - [`annotations`] - Annotation vocabulary and policy
//! - [`owner`] - Root controller resolution over owner references
//! - [`crd`] - cert-manager Certificate resource type
//! - [`certificate`] - Desired Certificate computation and create-or-replace
//! - [`webhook`] - Pod mutating admission webhook
//! - [`controller`] - Pod reconciler
//! - [`config`] - Immutable process configuration
//! - [`leader_election`] - Lease-based leader election for the reconciler
//! - [`server`] - Webhook and health probe servers
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod annotations;
pub mod certificate;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod owner;
pub mod server;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
