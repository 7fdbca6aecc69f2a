//! Run a single silo directly, without the daemon.
//!
//! Developer tool: builds a throwaway silo from a root directory (or a
//! busybox tarball), runs one command inside it, and tears everything
//! down on exit. No networking beyond loopback — for that, run colexd.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use colex_controller::bases::BaseProvider;
use colex_controller::interfaces::NetProvider;
use colex_controller::silo::{Silo, SiloOptions};

#[derive(Parser)]
#[command(name = "colex-exec", version, about = "Run one command in a throwaway silo")]
struct Cli {
    /// Command to invoke inside the silo.
    #[arg(long, default_value = "/bin/sh")]
    cmd: String,
    /// Arguments for the command.
    #[arg(long)]
    arg: Vec<String>,
    /// Environment variables the command has (KEY=value).
    #[arg(long, default_value = "PS1=\\u@\\h:\\w> ")]
    env: Vec<String>,
    /// Directory to use as the silo root filesystem.
    #[arg(long, default_value = "./")]
    root_fs: PathBuf,
    /// Hostname inside the silo.
    #[arg(long, default_value = "silo")]
    hostname: String,
    /// Build a baseline busybox root from this tarball instead of using
    /// --root-fs.
    #[arg(long)]
    baseline_env: Option<PathBuf>,
}

fn main() -> Result<()> {
    // The silo child re-execs this binary with the sentinel.
    colex_controller::reexec::dispatch();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .compact()
        .init();

    let mut opts = SiloOptions {
        hostname: Some(cli.hostname.clone()),
        interfaces: vec![NetProvider::Loopback],
        cmd: cli.cmd.clone(),
        args: cli.arg.clone(),
        env: cli.env.clone(),
        ..Default::default()
    };

    match &cli.baseline_env {
        Some(tarball) => {
            if !tarball.is_file() {
                bail!("busybox tarball {} not found", tarball.display());
            }
            // Root stays None: the silo creates (and deletes) a temp dir.
            opts.add_fs(BaseProvider::Busybox {
                tar_path: tarball.clone(),
            });
        }
        None => {
            let root = cli
                .root_fs
                .canonicalize()
                .with_context(|| format!("resolve {}", cli.root_fs.display()))?;
            opts.root = Some(root);
        }
    }
    opts.finalize(None);

    let mut silo = Silo::new(cli.hostname.clone(), opts);
    silo.init().context("silo init")?;
    silo.start().context("silo start")?;

    let status = silo.wait().context("silo wait")?;
    silo.close().context("silo close")?;

    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}
