//! Composition root: wires the sinks, the broadcast listener and the device session together.

use chrono::Local;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::transport::HeartRateCentral;
use crate::config::MonitorConfig;
use crate::data::HeartRateSample;
use crate::dispatch::{LatestSample, SampleDispatcher};
use crate::error::{Error, Result};
use crate::session::{DeviceSession, SessionState};
use crate::sink::{
    BroadcastServer, ConsoleSink, FileSink, LogSink, Sink, SinkHandle, SubscriberRegistry,
};

/// A running broadcast listener.
struct BroadcastTask {
    local_addr: SocketAddr,
    registry: SubscriberRegistry,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the whole pipeline for one process run.
///
/// Startup opens the sinks, then the broadcast listener, then starts the
/// device session. Shutdown runs the reverse order. A sink or listener that
/// fails to start is reported and left out; the rest keep running.
pub struct Monitor {
    config: MonitorConfig,
    dispatcher: Arc<SampleDispatcher>,
    session: Arc<DeviceSession>,
    cancel: CancellationToken,
    session_cancel: CancellationToken,
    session_task: Mutex<Option<JoinHandle<Result<()>>>>,
    broadcast: Mutex<Option<BroadcastTask>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Monitor {
    /// Create a monitor on top of a BLE central. Nothing runs until [`start`](Self::start).
    pub fn new(config: MonitorConfig, central: Arc<dyn HeartRateCentral>) -> Self {
        let dispatcher = Arc::new(SampleDispatcher::new(LatestSample::new()));
        let session = Arc::new(DeviceSession::new(
            central,
            dispatcher.clone(),
            config.session_config(),
        ));
        let cancel = CancellationToken::new();
        let session_cancel = cancel.child_token();

        Self {
            config,
            dispatcher,
            session,
            cancel,
            session_cancel,
            session_task: Mutex::new(None),
            broadcast: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Shared latest-sample handle.
    pub fn latest(&self) -> &LatestSample {
        self.dispatcher.latest()
    }

    /// Most recent sample, if any.
    pub fn latest_sample(&self) -> Option<HeartRateSample> {
        self.dispatcher.latest().get()
    }

    /// Get the device session.
    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Current state of the device session.
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Address of the broadcast listener, if it is running.
    pub fn broadcast_addr(&self) -> Option<SocketAddr> {
        self.broadcast.lock().as_ref().map(|b| b.local_addr)
    }

    /// Number of connected broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcast
            .lock()
            .as_ref()
            .map(|b| b.registry.len())
            .unwrap_or(0)
    }

    /// Names of the sinks that opened successfully.
    pub fn active_sinks(&self) -> Vec<String> {
        self.dispatcher.sink_names()
    }

    /// Open the sinks, start the listener and spawn the device session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] after [`shutdown`](Self::shutdown) and
    /// [`Error::AlreadyRunning`] if the monitor was already started.
    pub async fn start(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        if !self.config.has_outputs() {
            warn!("No outputs enabled, heart rate will only be logged");
        }

        self.open_sinks().await;

        if self.config.enable_broadcast {
            self.start_broadcast().await;
        }

        let session = self.session.clone();
        let cancel = self.session_cancel.clone();
        let handle = tokio::spawn(async move { session.run(cancel).await });
        *self.session_task.lock() = Some(handle);

        info!("Monitor started");
        Ok(())
    }

    /// Start, then run until `shutdown` fires or [`shutdown`](Self::shutdown) is called elsewhere.
    ///
    /// Always finishes with the full shutdown sequence.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.start().await?;

        tokio::select! {
            _ = shutdown.cancelled() => info!("Shutdown requested"),
            _ = self.cancel.cancelled() => debug!("Monitor cancelled"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop the session, then the listener, then close the sinks.
    ///
    /// Safe to call more than once. Once called, the monitor cannot be started.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Monitor already shut down");
            return;
        }

        info!("Shutting down");
        let grace = self.config.shutdown_grace;

        self.session_cancel.cancel();
        let session_task = self.session_task.lock().take();
        if let Some(handle) = session_task {
            // The session bounds its own BLE teardown by `grace`.
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace * 2, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Device session ended with error: {}", e),
                Ok(Err(e)) => warn!("Device session task failed: {}", e),
                Err(_) => {
                    warn!("Device session did not stop within {:?}", grace * 2);
                    abort.abort();
                }
            }
            self.session.mark_stopped();
        }

        let broadcast = self.broadcast.lock().take();
        if let Some(task) = broadcast {
            task.cancel.cancel();
            // The server drains its own connections within the grace period.
            let abort = task.handle.abort_handle();
            if tokio::time::timeout(grace * 2, task.handle).await.is_err() {
                warn!("Broadcast listener did not stop in time");
                abort.abort();
            }
        }

        self.dispatcher.close_sinks(grace).await;
        self.cancel.cancel();

        info!("Shutdown complete");
    }

    async fn open_sinks(&self) {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

        if self.config.enable_file {
            match FileSink::create(&self.config.file_path).await {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(e) => warn!(
                    "Cannot open {}, file output disabled: {}",
                    self.config.file_path.display(),
                    e
                ),
            }
        }

        if self.config.enable_log {
            match LogSink::create(&self.config.log_dir, Local::now()).await {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(e) => warn!(
                    "Cannot create log in {}, CSV logging disabled: {}",
                    self.config.log_dir.display(),
                    e
                ),
            }
        }

        if self.config.enable_console {
            sinks.push(Box::new(ConsoleSink::stdout()));
        }

        for sink in sinks {
            self.dispatcher
                .add_sink(SinkHandle::spawn(sink, self.config.sink_queue));
        }
    }

    async fn start_broadcast(&self) {
        let server = match BroadcastServer::bind(
            self.config.listen_addr,
            self.dispatcher.latest().clone(),
            self.config.broadcast_config(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                warn!("TCP broadcast disabled: {}", e);
                return;
            }
        };

        let cancel = self.cancel.child_token();
        let task = BroadcastTask {
            local_addr: server.local_addr(),
            registry: server.registry(),
            cancel: cancel.clone(),
            handle: tokio::spawn(server.run(cancel)),
        };
        *self.broadcast.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimulatedCentral;
    use crate::ble::transport::{DiscoveredDevice, HeartRateLink, NotificationStream};
    use async_trait::async_trait;
    use futures::stream::StreamExt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use uuid::Uuid;

    /// A strap whose link never answers an unsubscribe request.
    struct UnresponsiveCentral;

    struct UnresponsiveLink;

    #[async_trait]
    impl HeartRateCentral for UnresponsiveCentral {
        async fn discover(
            &self,
            _name_filter: &str,
            _timeout: Duration,
        ) -> Result<Option<DiscoveredDevice>> {
            Ok(Some(DiscoveredDevice {
                identifier: "AA:BB:CC:DD:EE:FF".to_string(),
                name: "XYZ-H6M-1234".to_string(),
                rssi: None,
            }))
        }

        async fn connect(&self, _device: &DiscoveredDevice) -> Result<Box<dyn HeartRateLink>> {
            Ok(Box::new(UnresponsiveLink))
        }
    }

    #[async_trait]
    impl HeartRateLink for UnresponsiveLink {
        async fn subscribe_notifications(
            &self,
            _characteristic: Uuid,
        ) -> Result<NotificationStream> {
            Ok(futures::stream::pending().boxed())
        }

        async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
            futures::future::pending().await
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn loopback_config() -> MonitorConfig {
        MonitorConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            shutdown_grace: Duration::from_secs(1),
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let monitor = Monitor::new(loopback_config(), Arc::new(SimulatedCentral::new()));
        monitor.shutdown().await;
        monitor.shutdown().await;
        assert_eq!(monitor.session_state(), SessionState::Scanning);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let monitor = Monitor::new(loopback_config(), Arc::new(SimulatedCentral::new()));
        monitor.start().await.unwrap();
        assert!(matches!(monitor.start().await, Err(Error::AlreadyRunning)));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_broken_sink_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            enable_file: true,
            enable_log: true,
            file_path: dir.path().join("missing").join("heart_rate.txt"),
            log_dir: dir.path().join("logs"),
            ..loopback_config()
        };

        let monitor = Monitor::new(config, Arc::new(SimulatedCentral::new()));
        monitor.start().await.unwrap();

        assert_eq!(monitor.active_sinks(), vec!["log".to_string()]);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_disables_broadcast_only() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            enable_broadcast: true,
            enable_file: true,
            listen_addr: taken.local_addr().unwrap(),
            file_path: dir.path().join("heart_rate.txt"),
            ..loopback_config()
        };

        let monitor = Monitor::new(config, Arc::new(SimulatedCentral::new()));
        monitor.start().await.unwrap();

        assert!(monitor.broadcast_addr().is_none());
        assert_eq!(monitor.subscriber_count(), 0);
        assert_eq!(monitor.active_sinks(), vec!["file".to_string()]);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_ends_on_shutdown_signal() {
        let central = Arc::new(SimulatedCentral::new());
        let monitor = Arc::new(Monitor::new(
            MonitorConfig {
                enable_broadcast: true,
                ..loopback_config()
            },
            central,
        ));

        let signal = CancellationToken::new();
        let run = tokio::spawn({
            let monitor = monitor.clone();
            let signal = signal.clone();
            async move { monitor.run(signal).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.broadcast_addr().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        signal.cancel();
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(monitor.session_state(), SessionState::Stopped);
        assert!(monitor.broadcast_addr().is_none());
        assert!(monitor.active_sinks().is_empty());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            enable_file: true,
            file_path: dir.path().join("heart_rate.txt"),
            ..loopback_config()
        };

        let monitor = Monitor::new(config, Arc::new(SimulatedCentral::new()));
        monitor.shutdown().await;

        assert!(matches!(monitor.start().await, Err(Error::ShutDown)));
        assert!(monitor.active_sinks().is_empty());
        assert!(!monitor.session().is_running());
    }

    #[tokio::test]
    async fn test_hung_ble_teardown_still_stops_session() {
        let config = MonitorConfig {
            shutdown_grace: Duration::from_millis(300),
            ..loopback_config()
        };
        let monitor = Monitor::new(config, Arc::new(UnresponsiveCentral));
        monitor.start().await.unwrap();

        let mut states = monitor.session().subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| s.is_subscribed()))
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), monitor.shutdown())
            .await
            .unwrap();

        assert_eq!(monitor.session_state(), SessionState::Stopped);
        assert!(!monitor.session().is_running());
    }
}
