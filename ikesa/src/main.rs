//! # ikesad
//!
//! A small daemon wrapping the IKEv2 state machine in a UDP event loop

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use ikesa::config::{Connection, ConnectionStore};
use ikesa::crypto::NullCrypto;
use ikesa::server::{Command, Server};
use ikesa::Demux;

use crate::cli::Cli;

mod cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let connections: Vec<Connection> = match &cli.config {
        None => vec![Connection {
            name: "default".into(),
            ..Connection::default()
        }],
        Some(path) => {
            let raw = match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(err) => {
                    error!("cannot read {}: {err}", path.display());
                    exit(1);
                }
            };
            match serde_json::from_str(&raw) {
                Ok(connections) => connections,
                Err(err) => {
                    error!("cannot parse {}: {err}", path.display());
                    exit(1);
                }
            }
        }
    };

    let demux = Demux::new(ConnectionStore::new(connections), Arc::new(NullCrypto));
    let (server, commands) = match Server::bind(demux, cli.listen).await {
        Ok(bound) => bound,
        Err(err) => {
            error!("{err}");
            exit(1);
        }
    };

    if let Some(remote) = cli.initiate {
        let _ = commands.send(Command::Initiate {
            connection: cli.connection.clone(),
            remote,
        });
    }

    if let Err(err) = server.run().await {
        error!("{err}");
        exit(1);
    }
}
