//! Wire format representations of RPCs.
//!
//! Bodies travel as MessagePack with named fields (`rmp_serde::to_vec_named`),
//! a self-describing binary encoding used identically by the daemon and the
//! CLI. Adding a field with `#[serde(default)]` stays wire-compatible in
//! both directions.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::spec::{FileDrop, SiloSpec};

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a packet for transport.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Decode a packet received from the peer.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ============================================================================
// RPC packets
// ============================================================================

/// Everything needed to start (or replace) a silo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpPacket {
    pub spec: SiloSpec,
    /// Extra file drops packed by the front-end (e.g. local files referenced
    /// from a silo config), applied after `spec.files`.
    #[serde(default)]
    pub files: Vec<FileDrop>,
}

/// Response to a successful `/up`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpResponse {
    pub id_hex: String,
    pub interfaces: Vec<Interface>,
}

/// Selector for `/down`: exactly one of `name`, `id` must be non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownPacket {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

/// Which selector a [`DownPacket`] carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownSelector {
    Name(String),
    Id(String),
}

impl DownPacket {
    /// Validate the one-of-name-or-id contract.
    pub fn selector(&self) -> Result<DownSelector, &'static str> {
        match (self.name.is_empty(), self.id.is_empty()) {
            (false, true) => Ok(DownSelector::Name(self.name.clone())),
            (true, false) => Ok(DownSelector::Id(self.id.clone())),
            (true, true) => Err("one of name or id must be set"),
            (false, false) => Err("only one of name or id may be set"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {}

/// Response to `/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub host_name: String,
    pub silos: Vec<SiloSummary>,
}

/// A silo as described on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiloSummary {
    pub name: String,
    pub class: String,
    pub id_hex: String,
    pub tags: Vec<String>,
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub stats: SiloStat,
}

/// Request to map a hostname to an IP for all silos' DNS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetHostRequest {
    pub host: String,
    pub ip: String,
}

/// Response to a successful `/enable-enroll`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableEnrollResponse {
    /// Unix epoch seconds after which the window closes.
    pub disables_at_epoch: u64,
    /// The enrollment secret to hand to the new user.
    pub code: String,
}

// ============================================================================
// Interface + stats records
// ============================================================================

/// What role a network device plays for a silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceKind {
    Loopback,
    Bridge,
    HostVeth,
    SiloVeth,
}

/// One network device belonging to a silo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub kind: InterfaceKind,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub stats: InterfaceStats,
}

/// Device counters from `/sys/class/net/<dev>/statistics`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

/// Baseline statistics about a silo.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SiloStat {
    pub mem: ProcMem,
}

/// Memory usage summed over every process in the silo's pid namespace.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProcMem {
    /// Total program size, bytes.
    pub size: u64,
    /// Resident set size, bytes.
    pub resident: u64,
    /// Shared pages, bytes.
    pub share: u64,
}

/// The address of the bridge device, if this silo has one.
pub fn bridge_address(interfaces: &[Interface]) -> Option<&str> {
    interfaces
        .iter()
        .find(|i| i.kind == InterfaceKind::Bridge)
        .and_then(|i| i.address.as_deref())
}

/// The address another silo (or the host) can route to, if any.
pub fn routeable_address(interfaces: &[Interface]) -> Option<&str> {
    interfaces
        .iter()
        .find(|i| i.kind == InterfaceKind::SiloVeth)
        .and_then(|i| i.address.as_deref())
}
