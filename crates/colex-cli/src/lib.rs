//! # colex-cli — command-line front-end for the colex host daemon.

pub mod certpin;
pub mod client;
pub mod commands;
pub mod siloconf;

pub use commands::run;
