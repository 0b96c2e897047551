//! cert-manager Certificate resource
//!
//! Only the fields this controller sets are modelled. Because updates replace
//! the whole object, any other spec field on an existing Certificate is dropped
//! on the next reconcile.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of cert-manager resources
pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";

/// Namespaced issuer kind
pub const ISSUER_KIND: &str = "Issuer";

/// Cluster-scoped issuer kind
pub const CLUSTER_ISSUER_KIND: &str = "ClusterIssuer";

/// Desired state of a cert-manager Certificate
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Subject common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    /// Issuer that signs the certificate
    pub issuer_ref: IssuerRef,

    /// Secret the signed key pair is written to
    pub secret_name: String,

    /// Private key parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<CertificatePrivateKey>,
}

/// Reference to a cert-manager Issuer or ClusterIssuer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer kind (Issuer or ClusterIssuer)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// API group of the issuer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

/// Private key generation options
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePrivateKey {
    /// Key algorithm
    pub algorithm: PrivateKeyAlgorithm,
    /// Key size in bits
    pub size: u32,
}

/// Key algorithms understood by cert-manager
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PrivateKeyAlgorithm {
    /// RSA
    #[serde(rename = "RSA")]
    Rsa,
    /// ECDSA
    #[serde(rename = "ECDSA")]
    Ecdsa,
    /// Ed25519
    Ed25519,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_resource_coordinates() {
        assert_eq!(Certificate::group(&()), CERT_MANAGER_GROUP);
        assert_eq!(Certificate::version(&()), "v1");
        assert_eq!(Certificate::kind(&()), "Certificate");
        assert_eq!(Certificate::plural(&()), "certificates");
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let spec = CertificateSpec {
            common_name: Some("default/web".to_string()),
            issuer_ref: IssuerRef {
                name: "root".to_string(),
                kind: CLUSTER_ISSUER_KIND.to_string(),
                group: CERT_MANAGER_GROUP.to_string(),
            },
            secret_name: "web-ira".to_string(),
            private_key: Some(CertificatePrivateKey {
                algorithm: PrivateKeyAlgorithm::Rsa,
                size: 8192,
            }),
        };

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["commonName"], "default/web");
        assert_eq!(value["secretName"], "web-ira");
        assert_eq!(value["issuerRef"]["kind"], "ClusterIssuer");
        assert_eq!(value["issuerRef"]["group"], "cert-manager.io");
        assert_eq!(value["privateKey"]["algorithm"], "RSA");
        assert_eq!(value["privateKey"]["size"], 8192);
    }

    #[test]
    fn test_existing_certificate_with_extra_fields_deserializes() {
        let cert: Certificate = serde_json::from_value(serde_json::json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": {"name": "web-ira", "namespace": "default", "resourceVersion": "42"},
            "spec": {
                "secretName": "web-ira",
                "issuerRef": {"name": "root"},
                "duration": "2160h",
                "usages": ["client auth"]
            }
        }))
        .unwrap();

        assert_eq!(cert.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(cert.spec.issuer_ref.kind, "");
        assert!(cert.spec.private_key.is_none());
    }
}
