//! McRing CLI
//!
//! One-shot commands against a set of memcached endpoints.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcr_client::{Client, ClientConfig, Expiry};
use tracing_subscriber::{fmt, EnvFilter};

/// McRing CLI
#[derive(Parser, Debug)]
#[command(name = "mcr")]
#[command(about = "memcached client with consistent-hash routing")]
#[command(version)]
struct Args {
    /// Server address (host:port); repeat for several endpoints
    #[arg(short, long = "server")]
    servers: Vec<String>,

    /// JSON client configuration; --server overrides its endpoint list
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a value to stdout
    Get {
        key: String,
    },

    /// Store a value
    Set {
        key: String,
        value: String,

        /// Opaque flags stored with the value
        #[arg(long, default_value_t = 0)]
        flags: u32,

        /// Time to live in seconds; 0 keeps the value until evicted
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },

    /// Delete a key
    Delete {
        key: String,
    },

    /// Increment a counter
    Incr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
    },

    /// Decrement a counter
    Decr {
        key: String,
        #[arg(default_value_t = 1)]
        delta: u64,
    },

    /// Reset a key's time to live
    Touch {
        key: String,
        ttl: u64,
    },

    /// Print every endpoint's server version
    Version,

    /// Invalidate all items on every endpoint
    Flush,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let client = Client::new(config).context("failed to build client")?;
    let result = run(&client, args.command);
    client.close();
    result
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            ClientConfig::from_json(&json)?
        }
        None => ClientConfig::default(),
    };
    if !args.servers.is_empty() {
        config.endpoints = args.servers.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(client: &Client, command: Commands) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    match command {
        Commands::Get { key } => match client.get(&key)? {
            Some(value) => {
                stdout.write_all(&value.data)?;
                writeln!(stdout)?;
            }
            None => bail!("{key}: not found"),
        },
        Commands::Set {
            key,
            value,
            flags,
            ttl,
        } => {
            client.set(&key, value.as_bytes(), flags, Expiry::from_secs(ttl))?;
            writeln!(stdout, "STORED")?;
        }
        Commands::Delete { key } => {
            if !client.delete(&key)? {
                bail!("{key}: not found");
            }
            writeln!(stdout, "DELETED")?;
        }
        Commands::Incr { key, delta } => match client.increment(&key, delta)? {
            Some(value) => writeln!(stdout, "{value}")?,
            None => bail!("{key}: not found"),
        },
        Commands::Decr { key, delta } => match client.decrement(&key, delta)? {
            Some(value) => writeln!(stdout, "{value}")?,
            None => bail!("{key}: not found"),
        },
        Commands::Touch { key, ttl } => {
            if !client.touch(&key, Expiry::from_secs(ttl))? {
                bail!("{key}: not found");
            }
            writeln!(stdout, "TOUCHED")?;
        }
        Commands::Version => {
            for (endpoint, version) in client.version()? {
                writeln!(stdout, "{endpoint}\t{version}")?;
            }
        }
        Commands::Flush => {
            client.flush_all()?;
            writeln!(stdout, "OK")?;
        }
    }
    Ok(())
}
