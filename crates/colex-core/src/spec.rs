//! The `SiloSpec` input contract.
//!
//! A `SiloSpec` is immutable once built: the config loader (or any other
//! front-end) produces one, the host consumes it. Nothing here touches the
//! kernel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Complete description of a silo to be started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiloSpec {
    /// Unique per host. An empty name is legal (the host keys its registry
    /// on whatever is given).
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub tags: Vec<String>,

    /// Image URI resolved by the host, e.g. `img://busybox`.
    #[serde(default)]
    pub base: String,

    /// Ordered file drops applied to the root filesystem during init.
    #[serde(default)]
    pub files: Vec<FileDrop>,

    /// Bind mounts, referenced by allow-list id. Host paths never travel
    /// over the wire; they resolve server-side only.
    #[serde(default)]
    pub binds: Vec<BindSpec>,

    #[serde(default)]
    pub invocation: Invocation,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub resources: Resources,

    /// Capability tokens consumed by the metadata service. Absence of a
    /// key means deny.
    #[serde(default)]
    pub grants: BTreeMap<String, bool>,
}

impl SiloSpec {
    /// Whether this silo holds the named capability.
    pub fn has_grant(&self, name: &str) -> bool {
        self.grants.get(name).copied().unwrap_or(false)
    }
}

/// How the bytes of a [`FileDrop`] are applied to the root filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Written verbatim at the silo path.
    Raw,
    /// Treated as a tar stream and unpacked at the silo path.
    Tarball,
}

impl Default for FileKind {
    fn default() -> Self {
        FileKind::Raw
    }
}

/// A blob placed into the silo's root filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDrop {
    pub silo_path: String,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub kind: FileKind,
}

/// A bind-mount request, by allow-list id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindSpec {
    pub bind_id: String,
    pub silo_path: String,
    #[serde(default)]
    pub is_file: bool,
}

/// The command executed inside the silo once setup completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=value` pairs; this is the child's exact environment.
    #[serde(default)]
    pub env: Vec<String>,
}

/// Silo network configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
}

/// Resource caps applied through cgroups. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_quota_percent: u32,
    #[serde(default)]
    pub memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_grant_absent_means_deny() {
        let mut spec = SiloSpec::default();
        assert!(!spec.has_grant("query_silos"));

        spec.grants.insert("query_silos".to_string(), true);
        assert!(spec.has_grant("query_silos"));

        spec.grants.insert("query_silos".to_string(), false);
        assert!(!spec.has_grant("query_silos"));
    }

    #[test]
    fn test_spec_deserializes_with_sparse_fields() {
        let spec: SiloSpec = serde_json::from_value(serde_json::json!({
            "name": "web",
            "base": "img://busybox",
            "invocation": { "cmd": "/bin/sh" },
        }))
        .unwrap();
        assert_eq!(spec.name, "web");
        assert_eq!(spec.invocation.cmd, "/bin/sh");
        assert!(spec.tags.is_empty());
        assert!(!spec.network.internet_access);
        assert_eq!(spec.resources.memory_bytes, 0);
    }

    #[test]
    fn test_file_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FileKind::Tarball).unwrap(),
            "\"tarball\""
        );
        let kind: FileKind = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(kind, FileKind::Raw);
    }
}
