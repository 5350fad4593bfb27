//! TLS configuration from PEM certificate and key files

use crate::{Result, ServerError};
use rustls::ServerConfig as RustlsServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// HTTPS settings; disabled when no certificate pair is configured
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn with_certs(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Build a TLS acceptor, or None when TLS is disabled
    pub fn build_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => {
                let acceptor = create_tls_acceptor(cert, key)?;
                info!(cert = %cert.display(), "TLS enabled");
                Ok(Some(acceptor))
            }
            (None, None) => Ok(None),
            _ => Err(ServerError::TlsError(
                "both a certificate and a key are required".to_string(),
            )),
        }
    }
}

fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let open = |path: &Path, what: &str| {
        File::open(path).map(BufReader::new).map_err(|e| {
            ServerError::CertificateError(format!("Failed to open {} {}: {}", what, path.display(), e))
        })
    };
    let mut cert_reader = open(cert_path, "certificate")?;
    let mut key_reader = open(key_path, "key")?;

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ServerError::CertificateError(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(ServerError::CertificateError(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ServerError::CertificateError(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| {
            ServerError::CertificateError(format!("No private key found in {}", key_path.display()))
        })?;

    let tls_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsError(format!("TLS config error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_has_no_acceptor() {
        assert!(TlsConfig::disabled().build_acceptor().unwrap().is_none());
        assert!(!TlsConfig::disabled().is_enabled());
    }

    #[test]
    fn test_half_configured_is_rejected() {
        let config = TlsConfig {
            cert_path: Some("/tmp/cert.pem".into()),
            key_path: None,
        };
        assert!(matches!(config.build_acceptor(), Err(ServerError::TlsError(_))));
    }

    #[test]
    fn test_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = TlsConfig::with_certs(dir.path().join("nope.pem"), dir.path().join("nope.key"));
        assert!(matches!(
            missing.build_acceptor(),
            Err(ServerError::CertificateError(_))
        ));

        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        let err = TlsConfig::with_certs(&cert, &key).build_acceptor().err().expect("expected error");
        assert!(err.to_string().contains("No certificates found"));
    }
}
