//! # colex — a lightweight Linux container host
//!
//! Facade crate that re-exports the colex workspace crates so consumers
//! can depend on a single `colex` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | colex-core | Silo IDs, naming, specs, wire format, auth records |
//! | [`controller`] | colex-controller | Namespaces, cgroups, rootfs, networking, silo lifecycle |
//! | [`hostd`] | colex-hostd | RPC daemon, registry, reaper, metadata + DNS service |
//! | [`cli`] | colex-cli | Config loading, RPC packing, TOFU pinning |

pub use colex_cli as cli;
pub use colex_controller as controller;
pub use colex_core as core;
pub use colex_hostd as hostd;
