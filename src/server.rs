//! HTTP servers
//!
//! The admission webhook is served over TLS with the certificate the API
//! server trusts; the health probes are plain HTTP on a separate address.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use tracing::info;

use crate::webhook::{webhook_router, WebhookState};
use crate::Error;

/// Serving certificate file name inside the cert dir
pub const TLS_CERT_FILE: &str = "tls.crt";
/// Serving key file name inside the cert dir
pub const TLS_KEY_FILE: &str = "tls.key";

const ALPN_HTTP1: &[u8] = b"http/1.1";
const ALPN_H2: &[u8] = b"h2";

/// Webhook server configuration
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// Directory holding `tls.crt` and `tls.key`
    pub cert_dir: PathBuf,
    /// Offer HTTP/2 during ALPN; off unless explicitly enabled (HTTP/2 Rapid Reset)
    pub enable_http2: bool,
}

impl WebhookServerConfig {
    /// Path of the serving certificate
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_CERT_FILE)
    }

    /// Path of the serving key
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_KEY_FILE)
    }
}

/// Liveness and readiness routes
pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// Serve the health probes until the process exits
pub async fn start_health_server(addr: SocketAddr) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("failed to bind health probe address {addr}: {e}")))?;

    info!(addr = %addr, "Starting health probe server");

    axum::serve(listener, health_router())
        .await
        .map_err(|e| Error::internal(format!("health probe server error: {e}")))
}

/// Serve the admission webhook over TLS
pub async fn start_webhook_server(
    config: WebhookServerConfig,
    state: Arc<WebhookState>,
) -> Result<(), Error> {
    let tls_config = load_tls(&config.cert_path(), &config.key_path(), config.enable_http2)?;

    info!(
        addr = %config.addr,
        cert_dir = %config.cert_dir.display(),
        http2 = config.enable_http2,
        "Starting webhook server"
    );

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(webhook_router(state).into_make_service())
        .await
        .map_err(|e| Error::internal(format!("webhook server error: {e}")))
}

/// ALPN protocols offered by the webhook listener
pub fn alpn_protocols(enable_http2: bool) -> Vec<Vec<u8>> {
    if enable_http2 {
        vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()]
    } else {
        vec![ALPN_HTTP1.to_vec()]
    }
}

fn load_tls(cert: &Path, key: &Path, enable_http2: bool) -> Result<RustlsConfig, Error> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("TLS config error ({}): {e}", cert.display())))?;
    config.alpn_protocols = alpn_protocols(enable_http2);

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn open_pem(path: &Path) -> Result<BufReader<File>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("failed to open {}: {e}", path.display())))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = certs(&mut open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::config(format!("failed to parse certificates from {}: {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    private_key(&mut open_pem(path)?)
        .map_err(|e| {
            Error::config(format!("failed to parse private key from {}: {e}", path.display()))
        })?
        .ok_or_else(|| Error::config(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use rstest::rstest;
    use tower::ServiceExt;

    #[rstest]
    #[case::liveness("/healthz")]
    #[case::readiness("/readyz")]
    #[tokio::test]
    async fn test_probes_return_ok(#[case] path: &str) {
        let response = health_router()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn test_cert_paths() {
        let config = WebhookServerConfig {
            addr: "0.0.0.0:9443".parse().unwrap(),
            cert_dir: PathBuf::from("/tmp/k8s-webhook-server/serving-certs"),
            enable_http2: false,
        };
        assert_eq!(
            config.cert_path(),
            PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.crt")
        );
        assert_eq!(
            config.key_path(),
            PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.key")
        );
    }

    /// Story: HTTP/2 is only negotiated when explicitly enabled
    #[test]
    fn story_http2_is_opt_in() {
        assert_eq!(alpn_protocols(false), vec![b"http/1.1".to_vec()]);
        assert_eq!(
            alpn_protocols(true),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_missing_certificate_is_config_error() {
        let dir = PathBuf::from("/nonexistent/ira-serving-certs");
        let err = load_tls(&dir.join(TLS_CERT_FILE), &dir.join(TLS_KEY_FILE), false).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_pem_without_certificates_is_config_error() {
        let dir = std::env::temp_dir().join(format!("ira-empty-pem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join(TLS_CERT_FILE);
        let key = dir.join(TLS_KEY_FILE);
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();

        let err = load_certs(&cert).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
        let err = load_private_key(&key).unwrap_err();
        assert!(err.to_string().contains("no private key found"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
