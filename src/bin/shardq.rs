//! shardq is a command-line client for shardcast. It sends a single request
//! to an engine node, waits for the reply, and prints the reply body as
//! pretty-printed JSON. Non-200 replies print to stderr and exit non-zero.

#![warn(clippy::all)]

use clap::Parser as _;

use shardcast::error::Result;
use shardcast::message::Address;
use shardcast::Client;

fn main() {
    if let Err(error) = Command::parse().run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

/// The shardq command.
#[derive(clap::Parser)]
#[command(about = "A shardcast client.", version)]
struct Command {
    /// The request type, e.g. search, add, count, or status.
    #[arg()]
    kind: String,

    /// The request body, as JSON.
    #[arg(default_value = "{}")]
    body: String,

    /// The dataset the request runs against.
    #[arg(short, long, default_value = "")]
    dataset: String,

    /// The engine node to connect to, as host:port/tag.
    #[arg(short = 'H', long, default_value = "127.0.0.1:10031/engine")]
    host: String,

    /// Seconds to wait for the reply.
    #[arg(short, long, default_value = "60")]
    timeout: u64,

    /// Send fire-and-forget, without waiting for a reply.
    #[arg(short, long)]
    notify: bool,
}

impl Command {
    fn run(self) -> Result<()> {
        let server = Address::parse(&self.host)?;
        let body = serde_json::from_str(&self.body)?;
        let client = Client::with_timeout(server, std::time::Duration::from_secs(self.timeout));

        if self.notify {
            return client.notify(&self.kind, &self.dataset, body);
        }

        let reply = client.request(&self.kind, &self.dataset, body)?;
        let status = reply.status_code.unwrap_or(200);
        if status != 200 {
            eprintln!("Error {status}: {}", reply.body);
            std::process::exit(1);
        }
        println!("{}", serde_json::to_string_pretty(&reply.body)?);
        Ok(())
    }
}
