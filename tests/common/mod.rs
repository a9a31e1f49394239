//! Shared fixtures for integration tests

#![allow(dead_code)]

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::{Path, PathBuf};
use tunnelbox::control::{CaTrustAnchor, TlsIdentity};

pub const SERVER_NAME: &str = "vpn.example.com";

/// Test CA with a server leaf signed by it
pub struct Pki {
    pub ca: CaTrustAnchor,
    pub ca_pem: String,
    pub server: TlsIdentity,
}

impl Pki {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "integration CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, SERVER_NAME);
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();

        Self {
            ca: CaTrustAnchor::from_der(vec![ca_cert.der().clone()]).unwrap(),
            ca_pem: ca_cert.pem(),
            server: TlsIdentity::new(
                vec![cert.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            ),
        }
    }

    /// Write the CA bundle into `dir`
    pub fn write_ca(&self, dir: &Path) -> PathBuf {
        let path = dir.join("ca.pem");
        std::fs::write(&path, &self.ca_pem).unwrap();
        path
    }
}
