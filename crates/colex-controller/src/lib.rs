//! # colex-controller — silo lifecycle
//!
//! Aggregates management of a single silo behind one state machine:
//! root filesystem assembly ([`bases`]), network attachment
//! ([`interfaces`], [`netlink`]), resource caps ([`cgroups`]), address
//! allocation ([`ippool`]), the clone/namespace plumbing ([`namespaces`]),
//! and the second-stage entry that runs inside the new namespaces
//! ([`reexec`]).
//!
//! The daemon drives silos exclusively through [`silo::Silo`]:
//! `new → init → start → wait / close`.

pub mod bases;
pub mod cgroups;
pub mod error;
pub mod interfaces;
pub mod ippool;
pub mod namespaces;
pub mod netlink;
pub mod reexec;
pub mod silo;

pub use error::ControllerError;
pub use ippool::{IpPool, IpSlice};
pub use silo::{Silo, SiloOptions, SiloState};
