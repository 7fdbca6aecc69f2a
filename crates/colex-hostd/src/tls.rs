//! TLS assembly for the RPC surface.
//!
//! The server presents either a configured certificate pair or an
//! ephemeral self-signed one generated at startup. Client certificates
//! are *requested but never verified here*: any presented chain completes
//! the handshake, and the authorization decision is made per-request by
//! SPKI match against the certs file. `/enroll` depends on unauthenticated
//! clients being able to finish a handshake with a cert in hand.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustls::DigitallySignedStruct;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};

use crate::config::TlsConfig;

/// Build the server TLS configuration.
pub fn server_config(cfg: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    let (certs, key) = match (&cfg.cert_file, &cfg.key_file) {
        (Some(cert_path), Some(key_path)) => load_identity(cert_path, key_path)?,
        _ => ephemeral_identity()?,
    };

    let _ = CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

    let verifier = AcceptAnyClientCert::new();
    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)
        .context("assemble server TLS config")?;
    Ok(Arc::new(config))
}

fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("read certificate {}", cert_path.display()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("parse certificate {}", cert_path.display()))?;

    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("read key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("parse key {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    Ok((certs, key))
}

/// Generate a throwaway self-signed identity for this daemon run.
/// Clients pin it on first contact.
pub fn ephemeral_identity() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key = rcgen::KeyPair::generate().context("generate server key")?;
    let params =
        rcgen::CertificateParams::new(vec!["colexd".to_string(), "localhost".to_string()])
            .context("build certificate params")?;
    let cert = params.self_signed(&key).context("self-sign server cert")?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(key.serialize_der().into());
    Ok((vec![cert_der], key_der))
}

/// The base64 SubjectPublicKeyInfo of a DER certificate — the identity
/// the certs file records.
pub fn spki_base64(cert_der: &[u8]) -> Result<String> {
    let (_, cert) =
        x509_parser::parse_x509_certificate(cert_der).context("parse peer certificate")?;
    Ok(BASE64.encode(cert.public_key().raw))
}

/// Completes client auth for any presented certificate. See the module
/// docs for why the handshake never rejects.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        AcceptAnyClientCert {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_identity_is_usable() {
        let (certs, _key) = ephemeral_identity().unwrap();
        assert_eq!(certs.len(), 1);
        // The cert parses and exposes an SPKI.
        let spki = spki_base64(certs[0].as_ref()).unwrap();
        assert!(!spki.is_empty());
    }

    #[test]
    fn test_spki_is_stable_for_same_cert() {
        let (certs, _key) = ephemeral_identity().unwrap();
        let a = spki_base64(certs[0].as_ref()).unwrap();
        let b = spki_base64(certs[0].as_ref()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_identities_have_distinct_spkis() {
        let (a, _) = ephemeral_identity().unwrap();
        let (b, _) = ephemeral_identity().unwrap();
        assert_ne!(
            spki_base64(a[0].as_ref()).unwrap(),
            spki_base64(b[0].as_ref()).unwrap()
        );
    }

    #[test]
    fn test_server_config_builds_with_ephemeral_identity() {
        let config = server_config(&TlsConfig::default()).unwrap();
        // Client cert verification is install-time configured; nothing to
        // assert beyond successful assembly.
        assert!(Arc::strong_count(&config) >= 1);
    }

    #[test]
    fn test_garbage_cert_fails_spki_extraction() {
        assert!(spki_base64(b"not a certificate").is_err());
    }
}
