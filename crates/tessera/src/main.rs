// SPDX-FileCopyrightText: 2026 Tessera Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tessera - a tiered, encrypted memory pool for conversational fragments.
//!
//! This is the binary entry point: `serve` runs the pool, `store` runs a
//! persistence process, and the remaining commands talk to a running pool
//! over the bridge.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod remote;
mod sealed;
mod serve;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tessera_config::model::TesseraConfig;
use tessera_core::types::{SearchFilters, SessionId};
use tessera_core::TesseraError;

/// Tessera - a tiered, encrypted memory pool.
#[derive(Parser, Debug)]
#[command(name = "tessera", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the XDG hierarchy. Sealed
    /// files are opened with `TESSERA_CONFIG_PASSPHRASE`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the memory pool with its bridge listener.
    Serve,
    /// Run a persistence process that stores overflow records in SQLite.
    Store {
        /// Address to listen on (defaults to `bridge.persistence_address`).
        #[arg(long)]
        listen: Option<String>,
        /// SQLite file for the stored records (defaults to `storage.database_path`).
        #[arg(long)]
        database: Option<String>,
    },
    /// Measure the round trip to a bridge peer.
    Ping {
        #[arg(long)]
        address: Option<String>,
    },
    /// Show slot occupancy, index sizes and queue depth of a running pool.
    Status {
        #[arg(long)]
        address: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
        /// Disable colors.
        #[arg(long)]
        plain: bool,
    },
    /// Search the thin index of a running pool.
    Search {
        query: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        topic: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        address: Option<String>,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show,
    /// Validate configuration and report every error.
    Validate,
    /// Print the user configuration path.
    Path,
    /// Encrypt a TOML config under `TESSERA_CONFIG_PASSPHRASE`.
    Seal {
        input: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Decrypt a sealed config and print it (or write it to `--output`).
    Unseal {
        input: PathBuf,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load and validate configuration at startup
    let loaded = match &cli.config {
        Some(path) => sealed::load_config(path),
        None => tessera_config::load_and_validate(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            tessera_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Commands::Serve) => serve::run_serve(config).await,
        Some(Commands::Store { listen, database }) => serve::run_store(config, listen, database).await,
        Some(Commands::Ping { address }) => remote::run_ping(&config, address).await,
        Some(Commands::Status {
            address,
            json,
            plain,
        }) => remote::run_status(&config, address, json, plain).await,
        Some(Commands::Search {
            query,
            session,
            provider,
            topic,
            limit,
            json,
            address,
        }) => {
            let filters = SearchFilters {
                session_id: session.map(SessionId),
                provider_tag: provider,
                topic,
                since: None,
                limit,
            };
            remote::run_search(&config, address, query, filters, json).await
        }
        Some(Commands::Config { action }) => run_config(&config, action),
        None => {
            println!("tessera: use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_config(config: &TesseraConfig, action: ConfigCommands) -> Result<(), TesseraError> {
    match action {
        ConfigCommands::Show => match toml::to_string_pretty(config) {
            Ok(text) => print!("{text}"),
            Err(e) => eprintln!("error: cannot render configuration: {e}"),
        },
        ConfigCommands::Validate => println!("tessera: config ok (instance.name={})", config.instance.name),
        ConfigCommands::Path => match tessera_config::loader::user_config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("tessera: no configuration directory on this platform"),
        },
        ConfigCommands::Seal { input, output } => {
            sealed::run_seal(config, &input, &output)?;
            println!("tessera: sealed {} -> {}", input.display(), output.display());
        }
        ConfigCommands::Unseal { input, output } => {
            let text = sealed::unseal(&input)?;
            match output {
                Some(path) => std::fs::write(&path, text).map_err(|e| {
                    TesseraError::Config(format!("cannot write {}: {e}", path.display()))
                })?,
                None => print!("{text}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[cfg(not(target_env = "msvc"))]
    fn jemalloc_is_active() {
        // Only jemalloc answers epoch advances.
        use tikv_jemalloc_ctl::{epoch, stats};
        epoch::advance().unwrap();
        let allocated = stats::allocated::read().unwrap();
        assert!(allocated > 0, "jemalloc should report non-zero allocation");
    }

    #[test]
    #[serial]
    fn binary_loads_config_defaults() {
        let config = tessera_config::load_and_validate().expect("default config should be valid");
        assert_eq!(config.instance.name, "tessera");
    }

    #[test]
    fn search_arguments_parse() {
        let cli = Cli::try_parse_from(["tessera", "search", "redis failover", "--session", "s1", "--limit", "3"]).unwrap();
        match cli.command {
            Some(Commands::Search {
                query,
                session,
                limit,
                json,
                ..
            }) => {
                assert_eq!(query, "redis failover");
                assert_eq!(session.as_deref(), Some("s1"));
                assert_eq!(limit, Some(3));
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_config_flag_is_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["tessera", "status", "--config", "/tmp/t.toml", "--json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(matches!(cli.command, Some(Commands::Status { json: true, .. })));
    }

    #[test]
    fn seal_arguments_parse() {
        let cli = Cli::try_parse_from(["tessera", "config", "seal", "tessera.toml", "-o", "tessera.sealed"]).unwrap();
        match cli.command {
            Some(Commands::Config {
                action: ConfigCommands::Seal { input, output },
            }) => {
                assert_eq!(input, PathBuf::from("tessera.toml"));
                assert_eq!(output, PathBuf::from("tessera.sealed"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn effective_config_renders_as_toml() {
        let text = toml::to_string_pretty(&TesseraConfig::default()).unwrap();
        assert!(text.contains("[pool]"));
        assert!(text.contains("max_slots = 5"));
    }
}
