//! Process configuration
//!
//! Values are validated once at startup and shared read-only behind an `Arc`.

use crate::annotations::{self, Annotations, IssuerSelection};
use crate::crd::{CLUSTER_ISSUER_KIND, ISSUER_KIND};
use crate::Error;

/// Default CPU request for the credential helper
pub const DEFAULT_CPU_REQUEST: &str = "250m";
/// Default memory request for the credential helper
pub const DEFAULT_MEMORY_REQUEST: &str = "64Mi";
/// Default memory limit for the credential helper
pub const DEFAULT_MEMORY_LIMIT: &str = "128Mi";
/// Default credential session duration in seconds
pub const DEFAULT_SESSION_DURATION: &str = "900";

/// Settings for the injected credential helper container
///
/// Empty resource strings mean "leave unset".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectorConfig {
    /// Credential helper image reference
    pub credential_helper_image: String,
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory limit
    pub memory_limit: String,
    /// Session duration passed to the helper
    pub session_duration: String,
}

impl InjectorConfig {
    /// Config for `image` with the default sizing
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            credential_helper_image: image.into(),
            cpu_request: DEFAULT_CPU_REQUEST.to_string(),
            memory_request: DEFAULT_MEMORY_REQUEST.to_string(),
            cpu_limit: String::new(),
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            session_duration: DEFAULT_SESSION_DURATION.to_string(),
        }
    }

    /// Reject configurations the injector cannot act on
    pub fn validate(self) -> Result<Self, Error> {
        if self.credential_helper_image.trim().is_empty() {
            return Err(Error::config("credential helper image must not be empty"));
        }

        for (setting, value) in [
            ("cpu request", &self.cpu_request),
            ("memory request", &self.memory_request),
            ("cpu limit", &self.cpu_limit),
            ("memory limit", &self.memory_limit),
        ] {
            if !value.is_empty() && !is_quantity(value) {
                return Err(Error::config(format!(
                    "credential helper {setting} {value:?} is not a resource quantity"
                )));
            }
        }
        Ok(self)
    }
}

/// Returns true if `value` follows the Kubernetes resource quantity grammar
///
/// `<sign>? <digits>[.<digits>] <suffix>` where the suffix is a binary SI unit
/// (`Ki`..`Ei`), a decimal SI unit (`n`, `u`, `m`, `k`, `M`..`E`) or a decimal
/// exponent (`e3`, `E-2`).
pub fn is_quantity(value: &str) -> bool {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let has_digits = number.chars().any(|c| c.is_ascii_digit());
    if !has_digits || number.matches('.').count() > 1 {
        return false;
    }

    match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => true,
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => true,
        _ => suffix.strip_prefix(['e', 'E']).is_some_and(|exponent| {
            let exponent = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            !exponent.is_empty() && exponent.chars().all(|c| c.is_ascii_digit())
        }),
    }
}

/// Issuer used when a pod does not override it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerDefaults {
    /// `Issuer` or `ClusterIssuer`
    pub kind: String,
    /// Issuer name
    pub name: String,
}

impl IssuerDefaults {
    /// Validate and build issuer defaults
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Result<Self, Error> {
        let kind = kind.into();
        if kind != CLUSTER_ISSUER_KIND && kind != ISSUER_KIND {
            return Err(Error::config(format!(
                "default issuer kind must be {CLUSTER_ISSUER_KIND} or {ISSUER_KIND}, got {kind:?}"
            )));
        }
        Ok(Self {
            kind,
            name: name.into(),
        })
    }

    /// Issuer for a pod, honoring its per-field overrides
    pub fn select(&self, annotations: Option<&Annotations>) -> IssuerSelection {
        annotations::issuer_selection(annotations, &self.kind, &self.name)
    }
}
