use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// The cli of ikesad
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Cli {
    /// The address to listen on
    #[clap(short, default_value = "0.0.0.0:500")]
    pub listen: SocketAddr,

    /// Path to the JSON connection configuration
    #[clap(short)]
    pub config: Option<PathBuf>,

    /// Initiate towards this peer right after start
    #[clap(long)]
    pub initiate: Option<SocketAddr>,

    /// Connection name used with --initiate
    #[clap(long, default_value = "default")]
    pub connection: String,
}
