//! Custom resource types
//!
//! The controller does not own any CRDs; it writes cert-manager Certificates.

mod certificate;

pub use certificate::{
    Certificate, CertificatePrivateKey, CertificateSpec, IssuerRef, PrivateKeyAlgorithm,
    CERT_MANAGER_GROUP, CLUSTER_ISSUER_KIND, ISSUER_KIND,
};
