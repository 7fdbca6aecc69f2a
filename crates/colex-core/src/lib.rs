//! # colex-core — shared types for the colex container host
//!
//! Everything the daemon, controller, and CLI agree on lives here:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`id`] | Silo identifiers (4 random bytes, 8 hex chars) |
//! | [`naming`] | Deterministic bridge/veth device names |
//! | [`spec`] | The `SiloSpec` input contract |
//! | [`wire`] | RPC packet types and the MessagePack codec |
//! | [`authfile`] | Authorized-user flat-file records |

pub mod authfile;
pub mod id;
pub mod naming;
pub mod spec;
pub mod wire;

pub use id::SiloId;
pub use spec::SiloSpec;
