//! Single-node demo binary. Reads configuration, accepts one message body
//! on the command line, runs it through the consensus core, and prints the
//! assigned message id once it is cluster-stable.
//!
//! Dialing the peers named in configuration is a transport concern out of
//! scope for this core (spec.md §1) — this binary always runs with an
//! empty peer set, which puts the [`chronobus::ConsensusEngine`] into its
//! single-node mode. Anything listed under `peers` is logged and ignored.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::warn;

use chronobus::broker::InMemoryBroker;
use chronobus::config::Configuration;
use chronobus::consensus::ConsensusEngine;

#[derive(Parser, Debug)]
#[command(name = "chronobus-node", about = "Total-order pub/sub broker core, single-node demo")]
struct Cli {
    /// Path to a TOML configuration file. Falls back to defaults if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topic to publish to.
    #[arg(long, default_value = "demo")]
    topic: String,

    /// Message body to publish.
    #[arg(long)]
    body: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chronobus::logging::init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Configuration::try_load(path)?,
        None => Configuration::default(),
    };

    if !config.peers.is_empty() {
        warn!(
            "configuration lists {} peer(s), but this demo binary has no transport to dial them; running single-node",
            config.peers.len()
        );
    }

    let broker = Arc::new(InMemoryBroker::new());
    let engine = ConsensusEngine::new(&config, broker, Vec::new());

    let id = engine.publish(&cli.topic, cli.body.into_bytes()).await?;
    println!("{id}");

    Ok(())
}
