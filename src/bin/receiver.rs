//! Minimal TCP subscriber: prints every heart rate the bridge broadcasts.

use clap::Parser;
use std::net::IpAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Options {
    /// Address of the bridge.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port of the bridge.
    #[arg(long, default_value_t = heartrate_bridge::config::DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();
    let stream = TcpStream::connect((options.host, options.port)).await?;
    info!("Connected to {}", stream.peer_addr()?);

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim().parse::<u16>() {
            Ok(bpm) => println!("Received: {}", bpm),
            Err(_) => warn!("Unexpected line: {:?}", line),
        }
    }

    info!("Connection closed by the bridge");
    Ok(())
}
