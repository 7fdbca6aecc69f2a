//! Silo configuration files.
//!
//! A config file describes one or more silos in TOML. File entries may
//! carry inline content or reference a local path, which is read and
//! packed into the `UpPacket` — the daemon never sees client paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use colex_core::spec::{
    BindSpec, FileDrop, FileKind, Invocation, NetworkSpec, Resources, SiloSpec,
};
use colex_core::wire::UpPacket;
use serde::Deserialize;

fn default_base() -> String {
    "img://busybox".to_string()
}

/// The structure of a silo config file.
#[derive(Debug, Deserialize)]
pub struct SiloFile {
    #[serde(default, rename = "silo")]
    pub silos: Vec<SiloEntry>,
}

/// One silo block.
#[derive(Debug, Deserialize)]
pub struct SiloEntry {
    pub name: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Image to build the root filesystem from; `img://{name}` resolves
    /// against the host's catalog.
    #[serde(default = "default_base")]
    pub base: String,

    #[serde(default, rename = "file")]
    pub files: Vec<FileEntry>,
    #[serde(default, rename = "bind")]
    pub binds: Vec<BindEntry>,

    #[serde(default)]
    pub invocation: Invocation,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub grants: BTreeMap<String, bool>,
}

/// A file resource for the silo: either inline `content` or a local
/// `path` relative to the config file.
#[derive(Debug, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub content: Option<String>,
    pub silo_path: String,
    #[serde(default)]
    pub kind: FileKind,
}

#[derive(Debug, Deserialize)]
pub struct BindEntry {
    pub id: String,
    pub silo_path: String,
    #[serde(default)]
    pub is_file: bool,
}

/// Load and parse a silo config file.
pub fn load(path: &Path) -> Result<SiloFile> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read silo config {}", path.display()))?;
    let file: SiloFile =
        toml::from_str(&data).with_context(|| format!("parse silo config {}", path.display()))?;
    if file.silos.is_empty() {
        bail!("{} defines no silos", path.display());
    }
    Ok(file)
}

impl SiloEntry {
    /// Build the wire packet, reading referenced local files relative to
    /// `conf_dir`.
    pub fn to_up_packet(&self, conf_dir: &Path) -> Result<UpPacket> {
        let mut files = Vec::with_capacity(self.files.len());
        for entry in &self.files {
            let data = match (&entry.content, &entry.path) {
                (Some(content), None) => content.clone().into_bytes(),
                (None, Some(path)) => {
                    let resolved = if path.is_absolute() {
                        path.clone()
                    } else {
                        conf_dir.join(path)
                    };
                    std::fs::read(&resolved)
                        .with_context(|| format!("read file resource {}", resolved.display()))?
                }
                (Some(_), Some(_)) => {
                    bail!("file for {:?} has both path and content", entry.silo_path)
                }
                (None, None) => {
                    bail!("file for {:?} needs either path or content", entry.silo_path)
                }
            };
            files.push(FileDrop {
                silo_path: entry.silo_path.clone(),
                data,
                kind: entry.kind,
            });
        }

        let spec = SiloSpec {
            name: self.name.clone(),
            class: self.class.clone(),
            tags: self.tags.clone(),
            base: self.base.clone(),
            files: Vec::new(),
            binds: self
                .binds
                .iter()
                .map(|b| BindSpec {
                    bind_id: b.id.clone(),
                    silo_path: b.silo_path.clone(),
                    is_file: b.is_file,
                })
                .collect(),
            invocation: self.invocation.clone(),
            network: self.network.clone(),
            resources: self.resources,
            grants: self.grants.clone(),
        };
        Ok(UpPacket { spec, files })
    }
}
