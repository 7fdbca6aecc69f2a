//! Request authorization and blind enrollment.
//!
//! Authorization is an SPKI lookup: the presented client certificate's
//! public key must appear in the append-only certs file. Enrollment binds
//! a new certificate to a name, but only while a time-bounded window —
//! opened by an already-authorized `/enable-enroll` call — is live, and
//! only with the window's secret key.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use colex_core::authfile::AuthorizedUser;
use colex_core::naming::sanitize_token;
use colex_core::wire::EnableEnrollResponse;
use rand::RngCore;
use thiserror::Error;
use tracing::info;

use crate::config::{AuthConfig, AuthMode};
use crate::tls::spki_base64;

/// Length of the URL-safe enrollment secret, pre-encoding.
const ENROLL_KEY_BYTES: usize = 8;

/// The role every blind-enrolled user receives.
const ENROLL_ROLE: &str = "root";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not authorized")]
    NotAuthorized,
    #[error("expected a client certificate")]
    CertificateRequired,
    #[error("enrollment is not open")]
    EnrollmentClosed,
    #[error("bad enrollment key")]
    BadKey,
    #[error("certs file: {0}")]
    CertsFile(#[from] std::io::Error),
    #[error("certs file record: {0}")]
    BadRecord(#[from] colex_core::authfile::AuthFileError),
    #[error("{0}")]
    BadCertificate(String),
}

#[derive(Debug, Clone)]
struct EnrollWindow {
    open_until: SystemTime,
    code: String,
}

/// Authorization state for the daemon.
pub struct Authenticator {
    mode: AuthMode,
    certs_file: PathBuf,
    window: Mutex<Option<EnrollWindow>>,
}

impl Authenticator {
    pub fn new(cfg: &AuthConfig) -> Self {
        Authenticator {
            mode: cfg.mode,
            certs_file: cfg.certs_file.clone(),
            window: Mutex::new(None),
        }
    }

    /// Authorize a request to `path`. Returns the matched user record, or
    /// `None` when the path or mode needs no authorization.
    pub fn check(
        &self,
        path: &str,
        peer_cert_der: Option<&[u8]>,
    ) -> Result<Option<AuthorizedUser>, AuthError> {
        if self.mode == AuthMode::Open {
            return Ok(None);
        }
        // Enrollment must work for clients that are not yet on file.
        if path == "/enroll" {
            return Ok(None);
        }

        let cert = peer_cert_der.ok_or(AuthError::CertificateRequired)?;
        let spki = spki_base64(cert).map_err(|e| AuthError::BadCertificate(e.to_string()))?;
        self.find_by_spki(&spki)?
            .map(Some)
            .ok_or(AuthError::NotAuthorized)
    }

    fn find_by_spki(&self, spki: &str) -> Result<Option<AuthorizedUser>, AuthError> {
        let contents = std::fs::read_to_string(&self.certs_file)?;
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let user = AuthorizedUser::parse_line(line)?;
            if user.spki_b64 == spki {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    /// Open (or re-open) the blind-enrollment window. A fresh secret is
    /// generated each call; concurrent calls overwrite each other.
    pub fn enable_enrollment(&self, window: Duration) -> EnableEnrollResponse {
        let mut bytes = [0u8; ENROLL_KEY_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let code = URL_SAFE_NO_PAD.encode(bytes);

        let open_until = SystemTime::now() + window;
        *self.window.lock().expect("enroll window lock") = Some(EnrollWindow {
            open_until,
            code: code.clone(),
        });

        let disables_at_epoch = open_until
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        info!(disables_at = disables_at_epoch, "Blind enrollment opened");
        EnableEnrollResponse {
            disables_at_epoch,
            code,
        }
    }

    /// Attempt a blind enrollment: window open, key correct, certificate
    /// presented. Success appends a record binding `name` to the cert's
    /// SPKI.
    pub fn try_enroll(
        &self,
        key: &str,
        name: &str,
        peer_cert_der: Option<&[u8]>,
    ) -> Result<(), AuthError> {
        {
            let window = self.window.lock().expect("enroll window lock");
            let Some(window) = window.as_ref() else {
                return Err(AuthError::EnrollmentClosed);
            };
            if SystemTime::now() > window.open_until {
                return Err(AuthError::EnrollmentClosed);
            }
            if window.code != key {
                return Err(AuthError::BadKey);
            }
        }

        let cert = peer_cert_der.ok_or(AuthError::CertificateRequired)?;
        let spki = spki_base64(cert).map_err(|e| AuthError::BadCertificate(e.to_string()))?;

        let user = AuthorizedUser {
            name: sanitize_token(name),
            role: ENROLL_ROLE.to_string(),
            created_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            spki_b64: spki,
        };

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.certs_file)?;
        // The leading newline keeps the record intact even when the file
        // lost its trailing newline; blank lines are ignored on read.
        write!(file, "\n{}", user.to_line())?;
        info!(name = %user.name, "Enrolled new user");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ephemeral_identity;

    fn certs_file_auth(path: PathBuf) -> Authenticator {
        Authenticator::new(&AuthConfig {
            mode: AuthMode::CertsFile,
            certs_file: path,
            blind_enrollment_seconds: 35,
        })
    }

    fn client_cert() -> Vec<u8> {
        let (certs, _) = ephemeral_identity().unwrap();
        certs[0].as_ref().to_vec()
    }

    #[test]
    fn test_open_mode_authorizes_everything() {
        let auth = Authenticator::new(&AuthConfig::default());
        assert!(auth.check("/up", None).unwrap().is_none());
    }

    #[test]
    fn test_enroll_path_never_requires_auth() {
        let auth = certs_file_auth(PathBuf::from("/nonexistent"));
        assert!(auth.check("/enroll", None).unwrap().is_none());
    }

    #[test]
    fn test_missing_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path);
        assert!(matches!(
            auth.check("/up", None),
            Err(AuthError::CertificateRequired)
        ));
    }

    #[test]
    fn test_unknown_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path);
        let cert = client_cert();
        assert!(matches!(
            auth.check("/up", Some(&cert)),
            Err(AuthError::NotAuthorized)
        ));
    }

    #[test]
    fn test_enroll_then_check_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path.clone());
        let cert = client_cert();

        let resp = auth.enable_enrollment(Duration::from_secs(35));
        auth.try_enroll(&resp.code, "alice", Some(&cert)).unwrap();

        let user = auth.check("/up", Some(&cert)).unwrap().unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.role, "root");

        // The file gained exactly one record.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().filter(|l| !l.is_empty()).count(), 1);
    }

    #[test]
    fn test_enroll_with_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path);
        let cert = client_cert();

        auth.enable_enrollment(Duration::from_secs(35));
        assert!(matches!(
            auth.try_enroll("wrong-key", "mallory", Some(&cert)),
            Err(AuthError::BadKey)
        ));
    }

    #[test]
    fn test_enroll_without_window_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path);
        let cert = client_cert();
        assert!(matches!(
            auth.try_enroll("anything", "bob", Some(&cert)),
            Err(AuthError::EnrollmentClosed)
        ));
    }

    #[test]
    fn test_enroll_after_window_expiry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path);
        let cert = client_cert();

        let resp = auth.enable_enrollment(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            auth.try_enroll(&resp.code, "late", Some(&cert)),
            Err(AuthError::EnrollmentClosed)
        ));
    }

    #[test]
    fn test_concurrent_enable_overwrites_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path);
        let cert = client_cert();

        let first = auth.enable_enrollment(Duration::from_secs(35));
        let second = auth.enable_enrollment(Duration::from_secs(35));
        assert_ne!(first.code, second.code);
        assert!(matches!(
            auth.try_enroll(&first.code, "stale", Some(&cert)),
            Err(AuthError::BadKey)
        ));
        auth.try_enroll(&second.code, "fresh", Some(&cert)).unwrap();
    }

    #[test]
    fn test_enrolled_name_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, "").unwrap();
        let auth = certs_file_auth(path.clone());
        let cert = client_cert();

        let resp = auth.enable_enrollment(Duration::from_secs(35));
        auth.try_enroll(&resp.code, "evil name\nroot", Some(&cert))
            .unwrap();
        let user = auth.check("/up", Some(&cert)).unwrap().unwrap();
        assert_eq!(user.name, "evilnameroot");
    }
}
