//! shardcast is a distributed query engine node. It loads its catalog and
//! cluster-state files, recovers any buffered backlog from a previous run,
//! and serves engine traffic on the configured listen address (default
//! 0.0.0.0:10031) until killed.

#![warn(clippy::all)]

use clap::Parser as _;
use serde_derive::Deserialize;

use shardcast::cluster::TcpTransport;
use shardcast::error::Result;
use shardcast::message::Address;
use shardcast::plugin::Registry;
use shardcast::server::Options;
use shardcast::{Engine, Server};

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

/// The shardcast server command.
#[derive(clap::Parser)]
#[command(about = "A shardcast engine node.", version)]
struct Command {
    /// Configuration file path.
    #[arg(short = 'c', long, default_value = "shardcast.yaml")]
    config: String,
}

impl Command {
    fn run(self) -> Result<()> {
        let config = Config::load(&self.config)?;

        let level = config.log_level.parse::<simplelog::LevelFilter>()?;
        let mut logconfig = simplelog::ConfigBuilder::new();
        if level != simplelog::LevelFilter::Debug {
            logconfig.add_filter_allow_str("shardcast");
        }
        simplelog::SimpleLogger::init(level, logconfig.build())?;

        let engine = Engine::new(Options {
            name: Address::parse(&config.name)?,
            catalog_path: config.catalog.into(),
            cluster_path: config.cluster.into(),
            buffer_dir: config.buffer_dir.into(),
            registry: Registry::builtin(),
            transport: Box::new(TcpTransport::new()),
            timeout_seconds: config.timeout_seconds,
            poll_seconds: config.poll_seconds,
        })?;
        let listener = std::net::TcpListener::bind(&config.listen)?;

        // The shutdown side stays open for the server's lifetime; like the
        // other daemons here, the process exits by being killed.
        let (_shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
        Server::new(engine).serve(listener, shutdown_rx)
    }
}

/// The server configuration. Values load from the config file and from
/// SHARDCAST_* environment variables, falling back to the defaults below.
#[derive(Debug, Deserialize)]
struct Config {
    /// This node's name, host:port/tag. Peers and the catalog refer to the
    /// node by this name, so it must resolve from the rest of the cluster.
    name: String,
    /// The TCP listen address.
    listen: String,
    log_level: String,
    /// The catalog file.
    catalog: String,
    /// The cluster-state file.
    cluster: String,
    /// The forward-buffer directory.
    buffer_dir: String,
    /// Session timeout for plans that declare none.
    timeout_seconds: u64,
    /// Catalog and cluster-state poll interval.
    poll_seconds: u64,
}

impl Config {
    fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("name", "127.0.0.1:10031/engine")?
            .set_default("listen", "0.0.0.0:10031")?
            .set_default("log_level", "info")?
            .set_default("catalog", "catalog.json")?
            .set_default("cluster", "cluster.json")?
            .set_default("buffer_dir", "buffer")?
            .set_default("timeout_seconds", 60)?
            .set_default("poll_seconds", 1)?
            .add_source(config::File::with_name(file).required(false))
            .add_source(config::Environment::with_prefix("SHARDCAST"))
            .build()?
            .try_deserialize()?)
    }
}
