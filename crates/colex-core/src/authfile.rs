//! Authorized-user records.
//!
//! The daemon's certs file is append-only and line-oriented: one user per
//! line, four space-separated fields:
//!
//! ```text
//! {name} {role-base64} {created-epoch} {spki-base64}
//! ```
//!
//! `role-base64` is base64 of the JSON object `{"Role": "..."}`; the last
//! field is the base64 DER SubjectPublicKeyInfo of the user's client
//! certificate. Blank lines are ignored. Scanning and appending live in
//! the daemon; this module only owns the record format.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::naming::sanitize_token;

#[derive(Debug, Error)]
pub enum AuthFileError {
    #[error("expected 4 space-separated fields, found {0}")]
    FieldCount(usize),
    #[error("bad created-epoch field: {0}")]
    Epoch(#[from] std::num::ParseIntError),
    #[error("bad role field: {0}")]
    RoleEncoding(#[from] base64::DecodeError),
    #[error("bad role JSON: {0}")]
    RoleJson(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct RoleRecord {
    #[serde(rename = "Role")]
    role: String,
}

/// One line of the certs file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedUser {
    pub name: String,
    pub role: String,
    pub created_epoch: u64,
    /// base64 (standard alphabet) of the SPKI DER.
    pub spki_b64: String,
}

impl AuthorizedUser {
    /// Parse a single non-blank line.
    pub fn parse_line(line: &str) -> Result<Self, AuthFileError> {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 4 {
            return Err(AuthFileError::FieldCount(fields.len()));
        }
        let role_json = BASE64.decode(fields[1])?;
        let role: RoleRecord = serde_json::from_slice(&role_json)?;
        Ok(AuthorizedUser {
            name: fields[0].to_string(),
            role: role.role,
            created_epoch: fields[2].parse()?,
            spki_b64: fields[3].to_string(),
        })
    }

    /// Render the record as one line, sanitizing free-form fields so they
    /// cannot break the format.
    pub fn to_line(&self) -> String {
        let role_json = serde_json::to_vec(&RoleRecord {
            role: self.role.clone(),
        })
        .expect("role record serializes");
        format!(
            "{} {} {} {}",
            sanitize_token(&self.name),
            BASE64.encode(role_json),
            self.created_epoch,
            self.spki_b64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_roundtrip() {
        let user = AuthorizedUser {
            name: "alice".to_string(),
            role: "root".to_string(),
            created_epoch: 1_700_000_000,
            spki_b64: "MFkwEwYHKoZI".to_string(),
        };
        let line = user.to_line();
        let back = AuthorizedUser::parse_line(&line).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn test_role_field_is_base64_json() {
        let user = AuthorizedUser {
            name: "bob".to_string(),
            role: "root".to_string(),
            created_epoch: 1,
            spki_b64: "AAAA".to_string(),
        };
        let line = user.to_line();
        let role_field = line.split(' ').nth(1).unwrap();
        let decoded = BASE64.decode(role_field).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            r#"{"Role":"root"}"#
        );
    }

    #[test]
    fn test_name_is_sanitized() {
        let user = AuthorizedUser {
            name: "mallory evil\nname".to_string(),
            role: "root".to_string(),
            created_epoch: 1,
            spki_b64: "AAAA".to_string(),
        };
        let line = user.to_line();
        assert_eq!(line.lines().count(), 1);
        let back = AuthorizedUser::parse_line(&line).unwrap();
        assert_eq!(back.name, "malloryevilname");
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        assert!(matches!(
            AuthorizedUser::parse_line("only three fields"),
            Err(AuthFileError::FieldCount(3))
        ));
    }
}
