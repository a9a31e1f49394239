//! CA trust anchor and certificate identities

use super::TlsError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::path::Path;
use std::sync::Arc;

/// Trusted roots for validating the server chain
///
/// Loaded once and shared read-only between sessions.
#[derive(Debug, Clone)]
pub struct CaTrustAnchor {
    roots: Arc<RootCertStore>,
}

impl CaTrustAnchor {
    /// Build from DER certificates
    pub fn from_der(certs: Vec<CertificateDer<'static>>) -> Result<Self, TlsError> {
        if certs.is_empty() {
            return Err(TlsError::Ca("no CA certificates supplied".to_string()));
        }
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| TlsError::Ca(format!("invalid CA certificate: {}", e)))?;
        }
        tracing::debug!(roots = roots.len(), "CA trust anchor loaded");
        Ok(Self {
            roots: Arc::new(roots),
        })
    }

    /// Build from a PEM bundle
    pub fn from_pem(pem: &[u8]) -> Result<Self, TlsError> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Ca(format!("malformed CA bundle: {}", e)))?;
        Self::from_der(certs)
    }

    /// Load a PEM bundle from disk
    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self, TlsError> {
        let pem = std::fs::read(path.as_ref()).map_err(|e| {
            TlsError::Ca(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_pem(&pem)
    }

    /// Number of trusted roots
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub(crate) fn root_store(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }
}

/// Certificate chain and private key presented to the peer
#[derive(Debug)]
pub struct TlsIdentity {
    pub(crate) chain: Vec<CertificateDer<'static>>,
    pub(crate) key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    /// Load a certificate chain and private key from PEM files
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self, TlsError> {
        let cert_pem = std::fs::read(cert_path.as_ref())
            .map_err(|e| TlsError::Generic(format!("failed to read certificate: {}", e)))?;
        let key_pem = std::fs::read(key_path.as_ref())
            .map_err(|e| TlsError::Generic(format!("failed to read private key: {}", e)))?;

        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Generic(format!("malformed certificate: {}", e)))?;
        if chain.is_empty() {
            return Err(TlsError::Generic("certificate file is empty".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| TlsError::Generic(format!("malformed private key: {}", e)))?
            .ok_or_else(|| TlsError::Generic("no private key found".to_string()))?;

        Ok(Self { chain, key })
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}
