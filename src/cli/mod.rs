//! CLI module - Command-line interface for Birdactyl
//!
//! One binary hosts both the panel and the node agent.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Birdactyl - game server panel and node agent
#[derive(Parser)]
#[command(name = "birdactyl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file to use instead of the search path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the panel API server
    Panel,

    /// Run or pair the node agent
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Create default config files
    #[command(alias = "--init")]
    Init,

    /// Manage panel users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Serve the agent API and report heartbeats
    Run,

    /// Serve the agent API with pairing armed
    Pair {
        /// How long to accept a pairing request (e.g. 90s, 5m, 1h)
        #[arg(long, default_value = "5m", value_parser = parse_duration)]
        duration: Duration,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user directly in the database
    Create {
        #[arg(long)]
        email: String,

        #[arg(long)]
        username: String,

        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,

        /// Grant admin rights
        #[arg(long)]
        admin: bool,
    },
}

/// `90`, `90s`, `5m` or `1h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.char_indices().last() {
        Some((idx, 's')) => (&raw[..idx], 1),
        Some((idx, 'm')) => (&raw[..idx], 60),
        Some((idx, 'h')) => (&raw[..idx], 3600),
        _ => (raw, 1),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    Ok(Duration::from_secs(value * multiplier))
}

pub use commands::*;
