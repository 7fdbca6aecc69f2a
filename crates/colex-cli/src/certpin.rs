//! Client-side certificate state under `~/.colex/`.
//!
//! Two concerns live here: the trust-on-first-use pin store for server
//! certificates (`known_hosts/{sanitized-addr}`, raw DER), and the
//! client's own identity (`client.crt`/`client.key`, PEM), generated on
//! first run and presented on every connection so the daemon can match
//! its SPKI.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The client state directory, `~/.colex`.
pub fn colex_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    Ok(home.join(".colex"))
}

/// Make an address safe to use as a filename.
pub fn sanitize_address(addr: &str) -> String {
    addr.chars()
        .filter_map(|c| match c {
            ':' => Some('-'),
            '/' | '\'' | '"' => None,
            other => Some(other),
        })
        .collect()
}

/// The pinned certificate for `addr`, if one was recorded.
pub fn pinned_cert(base: &Path, addr: &str) -> Result<Option<Vec<u8>>> {
    let path = base.join("known_hosts").join(sanitize_address(addr));
    match fs::read(&path) {
        Ok(der) => Ok(Some(der)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read pin {}", path.display())),
    }
}

/// Record `der` as the pinned certificate for `addr`.
pub fn pin_certificate(base: &Path, addr: &str, der: &[u8]) -> Result<()> {
    let dir = base.join("known_hosts");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(sanitize_address(addr));
    fs::write(&path, der).with_context(|| format!("write pin {}", path.display()))
}

/// The client's own certificate and key, DER-encoded.
pub struct ClientIdentity {
    pub cert_der: Vec<u8>,
    /// PKCS#8 DER.
    pub key_der: Vec<u8>,
}

/// Load the client identity, generating and persisting one on first use.
pub fn load_or_create_identity(base: &Path) -> Result<ClientIdentity> {
    let cert_path = base.join("client.crt");
    let key_path = base.join("client.key");

    if cert_path.exists() && key_path.exists() {
        return load_identity(&cert_path, &key_path);
    }

    let key = rcgen::KeyPair::generate().context("generate client key")?;
    let params = rcgen::CertificateParams::new(vec!["colex-client".to_string()])
        .context("build client certificate params")?;
    let cert = params.self_signed(&key).context("self-sign client cert")?;

    fs::create_dir_all(base).with_context(|| format!("create {}", base.display()))?;
    fs::write(&cert_path, cert.pem())
        .with_context(|| format!("write {}", cert_path.display()))?;
    fs::write(&key_path, key.serialize_pem())
        .with_context(|| format!("write {}", key_path.display()))?;

    Ok(ClientIdentity {
        cert_der: cert.der().as_ref().to_vec(),
        key_der: key.serialize_der(),
    })
}

fn load_identity(cert_path: &Path, key_path: &Path) -> Result<ClientIdentity> {
    let cert_pem =
        fs::read(cert_path).with_context(|| format!("read {}", cert_path.display()))?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .next()
        .with_context(|| format!("no certificate in {}", cert_path.display()))?
        .with_context(|| format!("parse {}", cert_path.display()))?
        .as_ref()
        .to_vec();

    let key_pem = fs::read(key_path).with_context(|| format!("read {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("parse {}", key_path.display()))?
        .with_context(|| format!("no private key in {}", key_path.display()))?;

    Ok(ClientIdentity {
        cert_der,
        key_der: key.secret_der().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_address() {
        assert_eq!(sanitize_address("10.0.0.1:8080"), "10.0.0.1-8080");
        assert_eq!(sanitize_address("host/../etc"), "host..etc");
        assert_eq!(sanitize_address("a'b\"c"), "abc");
    }

    #[test]
    fn test_pin_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pinned_cert(dir.path(), "10.0.0.1:8080").unwrap().is_none());

        pin_certificate(dir.path(), "10.0.0.1:8080", b"cert-der").unwrap();
        let pinned = pinned_cert(dir.path(), "10.0.0.1:8080").unwrap().unwrap();
        assert_eq!(pinned, b"cert-der");

        // Different address, different pin slot.
        assert!(pinned_cert(dir.path(), "10.0.0.2:8080").unwrap().is_none());
    }

    #[test]
    fn test_identity_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        assert!(!first.cert_der.is_empty());
        assert!(!first.key_der.is_empty());
        assert!(dir.path().join("client.crt").exists());
        assert!(dir.path().join("client.key").exists());

        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first.cert_der, second.cert_der);
    }
}
