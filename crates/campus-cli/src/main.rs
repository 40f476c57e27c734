//! Campus CLI
//!
//! Command-line front end for the campus sync engine: inspect the local
//! cache, watch live collections, exchange conversation keys and chat.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use campus_core::Config;

mod commands;
mod output;

use commands::watch::WatchKind;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "campus")]
#[command(about = "Campus - realtime sync and offline cache")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show configuration and local cache statistics
    Status,
    /// Print the conversation address of two users
    Address {
        /// First user id
        a: String,
        /// Second user id
        b: String,
    },
    /// Exchange conversation keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Print a collection every time it changes, until Ctrl-C
    Watch {
        /// What to watch
        #[arg(value_enum)]
        kind: WatchKind,
        /// Peer id (direct), group id (group-chat) or COURSE/MODULE (assignments)
        #[arg(short, long)]
        parent: Option<String>,
    },
    /// Send a message
    Send {
        /// Peer user id, or group id with --group
        to: String,
        /// Message text
        text: String,
        /// Send to a group chat instead of a direct conversation
        #[arg(short, long)]
        group: bool,
    },
    /// Stay online until Ctrl-C, then go offline
    Presence,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, user_id, listener_grace_ms, log_level, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a key for the conversation with a peer and show it as a QR code
    Share {
        /// Peer user id
        peer: String,
        /// Also write the QR code as SVG to this file
        #[arg(long)]
        svg: Option<PathBuf>,
    },
    /// Store a key payload scanned from a peer
    Import {
        /// The scanned payload text
        payload: String,
    },
    /// List conversations with a stored key
    #[command(alias = "ls")]
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands must work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &output)
            }
        };
    }

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config);

    match cli.command {
        Commands::Config { .. } => unreachable!(), // Handled above
        Commands::Status => commands::status::show(&config, &output),
        Commands::Address { a, b } => commands::address::show(&a, &b, &output),
        Commands::Key { command } => match command {
            KeyCommands::Share { peer, svg } => {
                commands::key::share(&config, &peer, svg.as_deref(), &output)
            }
            KeyCommands::Import { payload } => commands::key::import(&config, &payload, &output),
            KeyCommands::List => commands::key::list(&config, &output),
        },
        Commands::Watch { kind, parent } => {
            commands::watch::watch(&config, kind, parent.as_deref(), &output).await
        }
        Commands::Send { to, text, group } => {
            if group {
                commands::send::group(&config, &to, &text, &output).await
            } else {
                commands::send::direct(&config, &to, &text, &output).await
            }
        }
        Commands::Presence => commands::presence::run(&config, &output).await,
    }
}

/// Install the tracing subscriber
///
/// `RUST_LOG` overrides the configured level. Logs go to `log_file` when
/// set, otherwise to stderr.
fn init_logging(config: &Config) {
    let level = &config.log_level;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("campus_core={},campus_cli={}", level, level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    let Some(log_path) = config.log_file.as_ref() else {
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => {
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
