use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use heartrate_bridge::{Monitor, MonitorConfig, PlatformCentral};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Options {
    /// Serve the latest heart rate to TCP subscribers.
    #[arg(long)]
    tcp: bool,

    /// Keep the latest heart rate in a text file.
    #[arg(long)]
    txt: bool,

    /// Log every measurement to a CSV file.
    #[arg(long)]
    logcsv: bool,

    /// Print every measurement to stdout.
    #[arg(long)]
    stdout: bool,

    /// Length of one BLE discovery window, in seconds.
    #[arg(long, default_value_t = 5)]
    ble_timeout: u64,

    /// Substring of the advertised name of the heart-rate strap.
    #[arg(long, default_value = "H6M")]
    device_name: String,

    /// Address the TCP listener binds to.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port the TCP listener binds to.
    #[arg(long, default_value_t = heartrate_bridge::config::DEFAULT_PORT)]
    port: u16,

    /// Text file receiving the latest heart rate.
    #[arg(long, default_value = "heart_rate.txt")]
    txt_path: PathBuf,

    /// Directory receiving CSV logs.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Verbose output, log every device seen and every state change.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

impl Options {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            enable_broadcast: self.tcp,
            enable_file: self.txt,
            enable_log: self.logcsv,
            enable_console: self.stdout,
            device_name: self.device_name.clone(),
            discovery_timeout: Duration::from_secs(self.ble_timeout),
            listen_addr: SocketAddr::new(self.host, self.port),
            file_path: self.txt_path.clone(),
            log_dir: self.log_dir.clone(),
            ..MonitorConfig::default()
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(options: Options) -> heartrate_bridge::Result<()> {
    let central = PlatformCentral::new().await?;
    let monitor = Monitor::new(options.monitor_config(), Arc::new(central));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    monitor.run(shutdown).await
}

#[tokio::main]
async fn main() {
    let options = Options::parse();
    init_logging(options.verbose);

    // Panics inside a connection attempt are recovered by the session; only
    // one escaping the whole run ends the process with EXIT_PANIC.
    let code = match tokio::spawn(run(options)).await {
        Ok(Ok(())) => EXIT_SUCCESS,
        Ok(Err(why)) => {
            error!("{}", why);
            EXIT_ERROR
        }
        Err(e) if e.is_panic() => {
            error!("Panic! {}", e);
            EXIT_PANIC
        }
        Err(e) => {
            error!("{}", e);
            EXIT_ERROR
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_monitor_config() {
        let options = Options::parse_from(["heartrate-bridge"]);
        let config = options.monitor_config();

        assert!(!config.has_outputs());
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8888");
        assert_eq!(config.device_name, "H6M");
        assert_eq!(config.discovery_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_flags() {
        let options = Options::parse_from([
            "heartrate-bridge",
            "--tcp",
            "--txt",
            "--logcsv",
            "--port",
            "9000",
            "--ble-timeout",
            "10",
            "-v",
        ]);
        let config = options.monitor_config();

        assert!(config.enable_broadcast && config.enable_file && config.enable_log);
        assert!(!config.enable_console);
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.discovery_timeout, Duration::from_secs(10));
        assert!(options.verbose);
    }
}
