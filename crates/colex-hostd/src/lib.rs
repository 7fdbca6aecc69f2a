//! # colex-hostd — the container host daemon
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Host configuration (TOML + flag overrides) |
//! | [`tls`] | Server TLS assembly and SPKI extraction |
//! | [`auth`] | certs-file authorization and blind enrollment |
//! | [`server`] | HTTPS RPC surface, silo registry, reaper |
//! | [`metadata`] | Per-silo metadata HTTP + DNS service |

pub mod auth;
pub mod config;
pub mod metadata;
pub mod server;
pub mod tls;

pub use config::HostConfig;
pub use server::Server;
