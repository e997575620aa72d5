use std::path::PathBuf;

use clap::Parser;

/// Command line configuration for the server binary.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(version, about = "Serve files over HTTP with byte-range support and delivery telemetry")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:7777")]
    pub bind: String,

    /// Directory that `/getfile/<path>` is resolved beneath.
    #[arg(long, default_value = "/")]
    pub root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:7777".to_string(),
            root: PathBuf::from("/"),
        }
    }
}
