//! CLI argument parsing for treelink

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::transport::AttachPoint;

#[derive(Parser, Debug)]
#[command(name = "tl")]
#[command(author, version, about = "Coordinator/worker sessions over a multicast tree", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a coordinator and in-process workers through the PING protocol
    Demo {
        /// Number of workers
        #[arg(short, long, default_value = "4")]
        workers: u32,

        /// Topology file (default: a flat tree with one leaf per worker)
        #[arg(short, long)]
        topology: Option<PathBuf>,

        /// Launch workers on their own and let them find the tree through a connections file
        #[arg(short, long)]
        remote: bool,
    },

    /// Read or write a connections file
    Connections {
        /// Connections file (default: $TREELINK_CONNECTIONS_FILE)
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[command(subcommand)]
        command: ConnectionsCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConnectionsCommand {
    /// Partition workers over leaf attach points and write the file
    Write {
        /// Number of workers
        #[arg(short, long)]
        workers: u32,

        /// Leaf attach point as host:port:rank (repeatable)
        #[arg(short, long = "leaf", required = true, value_parser = parse_leaf)]
        leaves: Vec<AttachPoint>,
    },

    /// Print the parent of a worker rank
    Lookup {
        /// Worker rank
        #[arg(short, long)]
        rank: u32,
    },
}

/// Parse `host:port:rank`
pub fn parse_leaf(s: &str) -> Result<AttachPoint, String> {
    let mut parts = s.rsplitn(3, ':');
    let (Some(rank), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected host:port:rank, got '{}'", s));
    };
    if host.is_empty() {
        return Err(format!("missing host in '{}'", s));
    }
    let port = port.parse().map_err(|_| format!("invalid port '{}'", port))?;
    let rank = rank.parse().map_err(|_| format!("invalid rank '{}'", rank))?;
    Ok(AttachPoint {
        host: host.to_string(),
        port,
        rank,
    })
}
