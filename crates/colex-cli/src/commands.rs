//! The `colex` CLI surface.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colex_core::wire::{DownPacket, routeable_address};

use crate::client::Client;
use crate::siloconf;

#[derive(Parser)]
#[command(name = "colex", version, about = "Manage silos on a colex host")]
struct Cli {
    /// Host daemon address.
    #[arg(long, default_value = "localhost:8080")]
    host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or replace) every silo described in a config file
    Up {
        /// Path to the silo config file (TOML)
        conf: PathBuf,
    },
    /// Stop a silo by name or id
    Down {
        /// Silo name
        name: Option<String>,
        /// Silo id (8 hex chars)
        #[arg(long)]
        id: Option<String>,
    },
    /// List silos running on the host
    List,
    /// Map a hostname to an IP in every silo's DNS
    SetHost { hostname: String, ip: String },
    /// Open the blind-enrollment window and print the secret
    EnableEnroll,
    /// Enroll this client's certificate with the host
    Enroll {
        /// Enrollment secret from enable-enroll
        #[arg(long)]
        key: String,
        /// Name to register this client under
        #[arg(long)]
        name: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::connect(&cli.host)?;

    match cli.command {
        Commands::Up { conf } => cmd_up(&client, &conf),
        Commands::Down { name, id } => cmd_down(&client, name, id),
        Commands::List => cmd_list(&client),
        Commands::SetHost { hostname, ip } => {
            client.set_host(&hostname, &ip)?;
            println!("{} -> {}", hostname, ip);
            Ok(())
        }
        Commands::EnableEnroll => cmd_enable_enroll(&client),
        Commands::Enroll { key, name } => {
            client.enroll(&key, &name)?;
            println!("Enrolled as {:?}.", name);
            Ok(())
        }
    }
}

fn cmd_up(client: &Client, conf: &PathBuf) -> Result<()> {
    let file = siloconf::load(conf)?;
    let conf_dir = conf
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    for silo in &file.silos {
        let pkt = silo
            .to_up_packet(&conf_dir)
            .with_context(|| format!("silo {:?}", silo.name))?;
        let resp = client.up(&pkt)?;
        let address = routeable_address(&resp.interfaces).unwrap_or("-");
        println!("{}  id={}  addr={}", silo.name, resp.id_hex, address);
    }
    Ok(())
}

fn cmd_down(client: &Client, name: Option<String>, id: Option<String>) -> Result<()> {
    let pkt = match (name, id) {
        (Some(name), None) => DownPacket {
            name,
            ..Default::default()
        },
        (None, Some(id)) => DownPacket {
            id,
            ..Default::default()
        },
        _ => bail!("pass exactly one of a silo name or --id"),
    };
    client.down(&pkt)?;
    println!("Down.");
    Ok(())
}

fn cmd_list(client: &Client) -> Result<()> {
    let resp = client.list()?;
    println!("Host: {}", resp.host_name);
    if resp.silos.is_empty() {
        println!("No silos running.");
        return Ok(());
    }
    for silo in &resp.silos {
        let address = routeable_address(&silo.interfaces).unwrap_or("-");
        println!(
            "{:<20} {:<10} {}  addr={}  mem={}K  tags={}",
            silo.name,
            silo.id_hex,
            silo.class,
            address,
            silo.stats.mem.resident / 1024,
            silo.tags.join(","),
        );
    }
    Ok(())
}

fn cmd_enable_enroll(client: &Client) -> Result<()> {
    let resp = client.enable_enroll()?;
    println!("Enrollment open; code: {}", resp.code);
    println!("Window closes at epoch {}.", resp.disables_at_epoch);
    Ok(())
}
