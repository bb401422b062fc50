//! Runtime configuration for the [`Monitor`](crate::monitor::Monitor).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;
use crate::sink::{BroadcastConfig, SinkHandle};

/// Default TCP port of the broadcast listener.
pub const DEFAULT_PORT: u16 = 8888;

/// Which sinks to run and how every part of the pipeline is timed.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Serve the latest value to TCP subscribers.
    pub enable_broadcast: bool,
    /// Rewrite the single-record text file on every sample.
    pub enable_file: bool,
    /// Append every sample to a CSV log.
    pub enable_log: bool,
    /// Print every sample to stdout.
    pub enable_console: bool,

    /// Name substring identifying the target device.
    pub device_name: String,
    /// Length of one discovery window.
    pub discovery_timeout: Duration,
    /// Delay after a failure before scanning again.
    pub backoff: Duration,
    /// Interval between link liveness checks.
    pub liveness_interval: Duration,

    /// Address of the broadcast listener.
    pub listen_addr: SocketAddr,
    /// Interval between broadcasts.
    pub broadcast_period: Duration,
    /// Longest a write to one subscriber may stall before it is dropped.
    pub subscriber_stall_timeout: Duration,
    /// Lines queued per subscriber.
    pub subscriber_queue: usize,

    /// Path of the single-record text file.
    pub file_path: PathBuf,
    /// Directory receiving CSV logs.
    pub log_dir: PathBuf,
    /// Samples queued per sink.
    pub sink_queue: usize,

    /// Time allowed for each stage of shutdown.
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        let broadcast = BroadcastConfig::default();

        Self {
            enable_broadcast: false,
            enable_file: false,
            enable_log: false,
            enable_console: false,
            device_name: session.name_filter,
            discovery_timeout: session.discovery_timeout,
            backoff: session.backoff,
            liveness_interval: session.liveness_interval,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            broadcast_period: broadcast.period,
            subscriber_stall_timeout: broadcast.stall_timeout,
            subscriber_queue: broadcast.queue_capacity,
            file_path: PathBuf::from("heart_rate.txt"),
            log_dir: PathBuf::from("logs"),
            sink_queue: SinkHandle::DEFAULT_CAPACITY,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl MonitorConfig {
    /// Check if at least one output is enabled.
    pub fn has_outputs(&self) -> bool {
        self.enable_broadcast || self.enable_file || self.enable_log || self.enable_console
    }

    /// Parameters for the device session.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            name_filter: self.device_name.clone(),
            discovery_timeout: self.discovery_timeout,
            backoff: self.backoff,
            liveness_interval: self.liveness_interval,
            shutdown_grace: self.shutdown_grace,
        }
    }

    /// Parameters for the broadcast server.
    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            period: self.broadcast_period,
            stall_timeout: self.subscriber_stall_timeout,
            queue_capacity: self.subscriber_queue,
            shutdown_grace: self.shutdown_grace,
        }
    }
}
