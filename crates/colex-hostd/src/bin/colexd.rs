use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use colex_hostd::{HostConfig, Server};

#[derive(Parser)]
#[command(name = "colexd", version, about = "colex container host daemon")]
struct Cli {
    /// Path to the host configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address the server runs on; overrides the config file.
    #[arg(long)]
    addr: Option<String>,
    /// Subnet to use when assigning silo addresses; overrides the config
    /// file.
    #[arg(long = "ip-pool")]
    ip_pool: Option<String>,
}

fn main() -> Result<()> {
    // Silo children re-exec this binary; the sentinel check must run
    // before anything else touches argv.
    colex_controller::reexec::dispatch();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    config.apply_overrides(cli.addr.as_deref(), cli.ip_pool.as_deref());
    config.validate()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(Server::serve(config))
}
