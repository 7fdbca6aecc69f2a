//! Host daemon configuration.
//!
//! Loaded from a TOML file; the `--addr` and `--ip-pool` flags override
//! their file counterparts so a daemon can be pointed somewhere else
//! without editing config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

/// Scheme prefix for catalog-resolved image URIs.
const IMAGE_URI_PREFIX: &str = "img://";

/// Everything the daemon needs to run one host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Reported in `/list` responses.
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// Listen address for the RPC surface, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_listener")]
    pub listener: String,
    /// Subnet silo address slices are carved from.
    #[serde(default = "default_address_pool")]
    pub address_pool: String,
    /// Run silos without user namespaces (requires a root daemon).
    #[serde(default)]
    pub disable_user_namespaces: bool,

    #[serde(default)]
    pub authentication: AuthConfig,
    #[serde(default)]
    pub tls: TlsConfig,

    /// Image catalog: `img://{name}` resolves to a tarball path.
    #[serde(default, rename = "image")]
    pub images: Vec<ImageConfig>,
    /// Bind allow-list: silos reference entries by id, never by path.
    #[serde(default, rename = "bind")]
    pub binds: Vec<BindAllowConfig>,

    /// Static hostname → IP map served by every silo's DNS.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
}

fn default_host_name() -> String {
    "colex-host".to_string()
}

fn default_listener() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_address_pool() -> String {
    "10.69.69.0/24".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            host_name: default_host_name(),
            listener: default_listener(),
            address_pool: default_address_pool(),
            disable_user_namespaces: false,
            authentication: AuthConfig::default(),
            tls: TlsConfig::default(),
            images: Vec::new(),
            binds: Vec::new(),
            hosts: BTreeMap::new(),
        }
    }
}

/// Authentication modes for the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthMode {
    /// No checks. Local development only.
    #[serde(rename = "open")]
    Open,
    /// Authorize by SPKI match against the append-only certs file.
    #[serde(rename = "certs-file")]
    CertsFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_mode")]
    pub mode: AuthMode,
    #[serde(default)]
    pub certs_file: PathBuf,
    /// How long `/enable-enroll` keeps the window open.
    #[serde(default = "default_enroll_seconds")]
    pub blind_enrollment_seconds: u64,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Open
}

fn default_enroll_seconds() -> u64 {
    35
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            mode: default_auth_mode(),
            certs_file: PathBuf::new(),
            blind_enrollment_seconds: default_enroll_seconds(),
        }
    }
}

/// Server certificate material; both unset means an ephemeral
/// self-signed certificate is generated at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindAllowConfig {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub is_file: bool,
}

impl HostConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: HostConfig =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply flag overrides on top of file values.
    pub fn apply_overrides(&mut self, addr: Option<&str>, ip_pool: Option<&str>) {
        if let Some(addr) = addr {
            info!(listener = %addr, "Overriding config value for listener");
            self.listener = addr.to_string();
        }
        if let Some(pool) = ip_pool {
            info!(address_pool = %pool, "Overriding config value for address_pool");
            self.address_pool = pool.to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener.is_empty() {
            bail!("listener must be set");
        }
        if self.address_pool.is_empty() {
            bail!("address_pool must be set");
        }
        if self.authentication.mode == AuthMode::CertsFile
            && self.authentication.certs_file.as_os_str().is_empty()
        {
            bail!("certs-file authentication requires authentication.certs_file");
        }
        Ok(())
    }

    /// Resolve an `img://` URI against the catalog.
    pub fn image_path(&self, base_uri: &str) -> Option<&Path> {
        let name = base_uri.strip_prefix(IMAGE_URI_PREFIX)?;
        self.images
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.path.as_path())
    }

    /// Look up a bind allow-list entry.
    pub fn bind_by_id(&self, id: &str) -> Option<&BindAllowConfig> {
        self.binds.iter().find(|b| b.id == id)
    }
}
