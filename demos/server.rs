//! Instrument server backed by the simulated driver.
//!
//! ```text
//! cargo run --example relay-server -- --port 28265 --debug
//! ```

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use instrument_relay::driver::{Attribute, SimulatedDriver, SimulatedInstrument};
use instrument_relay::{Server, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Serve simulated lab instruments over TCP")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn bench_driver() -> SimulatedDriver {
    SimulatedDriver::new()
        .with_resource(
            "TCPIP::1.2.3.4::INSTR",
            SimulatedInstrument::new()
                .reply("*IDN?", "FakeInstrument,Model1,SN0001,1.0")
                .reply("MEAS:FREQ?", "1.000000E+06"),
        )
        .with_resource(
            "GPIB0::22::INSTR",
            SimulatedInstrument::new()
                .reply("*IDN?", "FakeMeter,DMM7510,SN0042,2.1")
                .reply("MEAS:VOLT:DC?", "+4.99872E+00")
                .attribute(Attribute::Lock, json!("none")),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let server = Server::builder()
        .bind_address(format!("{}:{}", args.host, args.port))
        .bind(bench_driver())
        .await?;
    info!("Serving simulated instruments on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;
    Ok(())
}
