//! Query an instrument through a relay server.
//!
//! ```text
//! cargo run --example relay-client -- --resource "GPIB0::22::INSTR" "*IDN?" "MEAS:VOLT:DC?"
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use instrument_relay::{Client, DEFAULT_SERVER_ADDRESS};

#[derive(Parser, Debug)]
#[command(name = "relay-client")]
#[command(about = "Send queries to a remote instrument")]
struct Args {
    /// Relay server address
    #[arg(short, long, default_value = DEFAULT_SERVER_ADDRESS)]
    server: String,

    /// VISA resource to open; lists resources when omitted
    #[arg(short, long)]
    resource: Option<String>,

    /// Connect timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Queries to send
    queries: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let mut client = Client::builder()
        .address(args.server)
        .connect_timeout(Duration::from_millis(args.timeout_ms))
        .build();

    let Some(resource) = args.resource else {
        for name in client.list_instruments().await? {
            println!("{}", name);
        }
        return Ok(());
    };

    let handle = client.open(&resource).await?;
    for query in &args.queries {
        let reply = client.ask(handle, query).await?;
        println!("{} -> {}", query, String::from_utf8_lossy(&reply).trim_end());
    }
    client.close(handle).await?;
    client.disconnect().await;
    Ok(())
}
