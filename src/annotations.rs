//! Annotation policy
//!
//! Pods opt in to credential injection with three annotations naming the
//! Roles Anywhere trust anchor, profile and role. Only key presence is checked;
//! the values are handed to the credential helper as-is.

use std::collections::BTreeMap;

/// Annotation namespace shared by every key below
pub const ANNOTATION_PREFIX: &str = "ira.ontsys.com/";

/// Trust anchor ARN
pub const TRUST_ANCHOR_ANNOTATION: &str = "ira.ontsys.com/trust-anchor";
/// Profile ARN
pub const PROFILE_ANNOTATION: &str = "ira.ontsys.com/profile";
/// Role ARN
pub const ROLE_ANNOTATION: &str = "ira.ontsys.com/role";
/// Overrides the certificate and secret name
pub const CERT_ANNOTATION: &str = "ira.ontsys.com/cert";
/// Overrides the cert-manager issuer kind
pub const ISSUER_KIND_ANNOTATION: &str = "ira.ontsys.com/issuer-kind";
/// Overrides the cert-manager issuer name
pub const ISSUER_NAME_ANNOTATION: &str = "ira.ontsys.com/issuer-name";
/// Appends a trailing slash to the metadata endpoint when non-empty
pub const TRAILING_SLASH_ANNOTATION: &str = "ira.ontsys.com/metadata-endpoint-trailing-slash";

/// Suffix appended to the controller name when no cert override is present
pub const CERT_NAME_SUFFIX: &str = "-ira";

/// Pod annotations as they appear on `ObjectMeta`
pub type Annotations = BTreeMap<String, String>;

/// The three identity values required for injection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityAnnotations<'a> {
    /// Trust anchor ARN
    pub trust_anchor: &'a str,
    /// Profile ARN
    pub profile: &'a str,
    /// Role ARN
    pub role: &'a str,
}

impl<'a> IdentityAnnotations<'a> {
    /// Extract the identity triple, or None if any key is missing
    pub fn from_annotations(annotations: Option<&'a Annotations>) -> Option<Self> {
        let annotations = annotations?;
        Some(Self {
            trust_anchor: annotations.get(TRUST_ANCHOR_ANNOTATION)?,
            profile: annotations.get(PROFILE_ANNOTATION)?,
            role: annotations.get(ROLE_ANNOTATION)?,
        })
    }
}

/// Issuer chosen for a certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerSelection {
    /// Issuer kind (`Issuer` or `ClusterIssuer`)
    pub kind: String,
    /// Issuer name
    pub name: String,
}

/// True iff the trust anchor, profile and role keys are all present.
/// Empty values still count.
pub fn has_identity(annotations: Option<&Annotations>) -> bool {
    IdentityAnnotations::from_annotations(annotations).is_some()
}

/// Certificate (and secret) name: the `cert` override, else `<controller>-ira`
pub fn cert_name(annotations: Option<&Annotations>, controller_name: &str) -> String {
    match annotations.and_then(|a| a.get(CERT_ANNOTATION)) {
        Some(name) => name.clone(),
        None => format!("{controller_name}{CERT_NAME_SUFFIX}"),
    }
}

/// Per-field issuer override, falling back to the supplied defaults
pub fn issuer_selection(
    annotations: Option<&Annotations>,
    default_kind: &str,
    default_name: &str,
) -> IssuerSelection {
    let lookup = |key: &str, default: &str| {
        annotations
            .and_then(|a| a.get(key))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    IssuerSelection {
        kind: lookup(ISSUER_KIND_ANNOTATION, default_kind),
        name: lookup(ISSUER_NAME_ANNOTATION, default_name),
    }
}

/// Whether the metadata endpoint should carry a trailing slash
pub fn wants_trailing_slash(annotations: Option<&Annotations>) -> bool {
    annotations
        .and_then(|a| a.get(TRAILING_SLASH_ANNOTATION))
        .is_some_and(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn identity() -> Annotations {
        BTreeMap::from([
            (TRUST_ANCHOR_ANNOTATION.to_string(), "ta".to_string()),
            (PROFILE_ANNOTATION.to_string(), "p".to_string()),
            (ROLE_ANNOTATION.to_string(), "c".to_string()),
        ])
    }

    #[test]
    fn test_all_keys_share_prefix() {
        for key in [
            TRUST_ANCHOR_ANNOTATION,
            PROFILE_ANNOTATION,
            ROLE_ANNOTATION,
            CERT_ANNOTATION,
            ISSUER_KIND_ANNOTATION,
            ISSUER_NAME_ANNOTATION,
            TRAILING_SLASH_ANNOTATION,
        ] {
            assert!(key.starts_with(ANNOTATION_PREFIX), "{key}");
        }
    }

    #[test]
    fn test_full_identity_is_detected() {
        let annotations = identity();
        assert!(has_identity(Some(&annotations)));

        let parsed = IdentityAnnotations::from_annotations(Some(&annotations)).unwrap();
        assert_eq!(parsed.trust_anchor, "ta");
        assert_eq!(parsed.profile, "p");
        assert_eq!(parsed.role, "c");
    }

    /// Story: removing any one of the three keys disables injection
    #[rstest]
    #[case::no_trust_anchor(TRUST_ANCHOR_ANNOTATION)]
    #[case::no_profile(PROFILE_ANNOTATION)]
    #[case::no_role(ROLE_ANNOTATION)]
    fn story_missing_any_identity_key_means_no_identity(#[case] missing: &str) {
        let mut annotations = identity();
        annotations.remove(missing);
        assert!(!has_identity(Some(&annotations)));
    }

    #[test]
    fn test_absent_map_is_empty() {
        assert!(!has_identity(None));
        assert_eq!(cert_name(None, "web"), "web-ira");
        assert_eq!(
            issuer_selection(None, "ClusterIssuer", "root"),
            IssuerSelection {
                kind: "ClusterIssuer".to_string(),
                name: "root".to_string()
            }
        );
        assert!(!wants_trailing_slash(None));
    }

    #[test]
    fn test_empty_values_still_count_as_present() {
        let annotations = BTreeMap::from([
            (TRUST_ANCHOR_ANNOTATION.to_string(), String::new()),
            (PROFILE_ANNOTATION.to_string(), String::new()),
            (ROLE_ANNOTATION.to_string(), String::new()),
        ]);
        assert!(has_identity(Some(&annotations)));
    }

    #[test]
    fn test_cert_override_wins() {
        let mut annotations = identity();
        assert_eq!(cert_name(Some(&annotations), "annotated"), "annotated-ira");

        annotations.insert(CERT_ANNOTATION.to_string(), "cert-name".to_string());
        assert_eq!(cert_name(Some(&annotations), "annotated"), "cert-name");
    }

    #[test]
    fn test_issuer_fields_override_independently() {
        let mut annotations = identity();
        annotations.insert(ISSUER_NAME_ANNOTATION.to_string(), "team-ca".to_string());

        let selection = issuer_selection(Some(&annotations), "ClusterIssuer", "root");
        assert_eq!(selection.kind, "ClusterIssuer");
        assert_eq!(selection.name, "team-ca");

        annotations.insert(ISSUER_KIND_ANNOTATION.to_string(), "Issuer".to_string());
        let selection = issuer_selection(Some(&annotations), "ClusterIssuer", "root");
        assert_eq!(selection.kind, "Issuer");
        assert_eq!(selection.name, "team-ca");
    }

    #[rstest]
    #[case::absent(None, false)]
    #[case::empty(Some(""), false)]
    #[case::set(Some("true"), true)]
    #[case::any_value(Some("false"), true)]
    fn test_trailing_slash(#[case] value: Option<&str>, #[case] expected: bool) {
        let mut annotations = identity();
        if let Some(v) = value {
            annotations.insert(TRAILING_SLASH_ANNOTATION.to_string(), v.to_string());
        }
        assert_eq!(wants_trailing_slash(Some(&annotations)), expected);
    }
}
