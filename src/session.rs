//! Device session: the discover → connect → subscribe → listen → backoff cycle.
//!
//! A [`DeviceSession`] keeps one heart-rate strap connected for as long as it
//! runs. Every failure of the wireless link is treated as transient: the
//! session reports it, waits out the backoff delay and starts scanning
//! again. Only cancellation ends the loop.

use futures::stream::StreamExt;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ble::transport::{DiscoveredDevice, HeartRateCentral, HeartRateLink};
use crate::ble::uuids::HEART_RATE_MEASUREMENT_UUID;
use crate::data::HeartRateSample;
use crate::dispatch::SampleDispatcher;
use crate::error::{Error, Result};
use crate::protocol::decode;

/// Lifecycle state of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Looking for a device whose name matches the filter.
    #[default]
    Scanning,
    /// Connecting and enabling notifications.
    Connecting,
    /// Receiving heart-rate notifications.
    Subscribed,
    /// Waiting before the next scan.
    Backoff,
    /// Cancelled; the loop has exited.
    Stopped,
}

impl SessionState {
    /// Check if notifications are flowing.
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Subscribed)
    }

    /// Check if the session has ended.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Backoff => write!(f, "Backoff"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Parameters of the session loop.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Case-insensitive substring the advertised name must contain.
    pub name_filter: String,
    /// Length of one discovery window.
    pub discovery_timeout: Duration,
    /// Delay between a failure and the next scan.
    pub backoff: Duration,
    /// How often to ask the stack whether the link is still up.
    pub liveness_interval: Duration,
    /// Upper bound on the unsubscribe/disconnect teardown.
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name_filter: "H6M".to_string(),
            discovery_timeout: Duration::from_secs(5),
            backoff: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Keeps a heart-rate sensor connected and feeds its samples to a dispatcher.
pub struct DeviceSession {
    central: Arc<dyn HeartRateCentral>,
    dispatcher: Arc<SampleDispatcher>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    running: AtomicBool,
    malformed: AtomicU64,
}

impl DeviceSession {
    /// Create a session. Nothing happens until [`run`](Self::run) is called.
    pub fn new(
        central: Arc<dyn HeartRateCentral>,
        dispatcher: Arc<SampleDispatcher>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());

        Self {
            central,
            dispatcher,
            config,
            state_tx,
            running: AtomicBool::new(false),
            malformed: AtomicU64::new(0),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Check if the run loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of notifications that failed to decode.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Wait until a running loop has reached [`SessionState::Stopped`].
    ///
    /// Returns immediately if the loop is not running.
    pub async fn wait_stopped(&self) {
        if !self.is_running() {
            return;
        }
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| s.is_stopped()).await;
    }

    /// Run the session until `cancel` fires.
    ///
    /// Link failures never end the loop; they lead to [`SessionState::Backoff`]
    /// and another scan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if another call to `run` is active.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        info!(
            "Device session started, looking for \"{}\"",
            self.config.name_filter
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(SessionState::Scanning);

            let discovered = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_discovery().await;
                    break;
                }
                found = self.central.discover(
                    &self.config.name_filter,
                    self.config.discovery_timeout,
                ) => found,
            };

            let device = match discovered {
                Ok(Some(device)) => device,
                Ok(None) => {
                    info!(
                        "No device matching \"{}\" found, make sure the strap is on and in range",
                        self.config.name_filter
                    );
                    continue;
                }
                Err(e) => {
                    warn!("Discovery failed: {}", e);
                    if self.backoff(&cancel).await {
                        continue;
                    }
                    break;
                }
            };

            info!("Found target device: {}", device);
            self.set_state(SessionState::Connecting);

            let attempt = AssertUnwindSafe(self.connect_and_listen(&device, &cancel))
                .catch_unwind()
                .await;

            match attempt {
                Ok(Ok(())) => break,
                Ok(Err(e)) if e.is_link_loss() => warn!("Connection to {} lost: {}", device, e),
                Ok(Err(e)) => warn!("Connection to {} failed: {}", device, e),
                Err(_) => error!("Session attempt on {} panicked, treating as link loss", device),
            }

            if !self.backoff(&cancel).await {
                break;
            }
        }

        self.mark_stopped();
        info!("Device session stopped");

        Ok(())
    }

    /// Record that the run loop is gone, also when its task had to be aborted.
    pub(crate) fn mark_stopped(&self) {
        self.set_state(SessionState::Stopped);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop a scan abandoned by cancellation, bounded by the shutdown grace.
    async fn stop_discovery(&self) {
        match tokio::time::timeout(self.config.shutdown_grace, self.central.stop_discovery()).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to stop discovery: {}", e),
            Err(_) => warn!(
                "Stopping discovery did not finish within {:?}",
                self.config.shutdown_grace
            ),
        }
    }

    /// Sit in Backoff for the configured delay. Returns `false` if cancelled meanwhile.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        self.set_state(SessionState::Backoff);
        info!("Retrying in {}s", self.config.backoff.as_secs_f32());

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.backoff) => true,
        }
    }

    /// One connect/listen attempt. `Ok` means the attempt ended through cancellation.
    async fn connect_and_listen(
        &self,
        device: &DiscoveredDevice,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let link = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            link = self.central.connect(device) => link?,
        };

        if !link.is_connected().await {
            self.release(link.as_ref()).await;
            return Err(Error::NotConnected);
        }

        info!("Connected to {}", device);

        let result = self.listen(link.as_ref(), cancel).await;
        self.release(link.as_ref()).await;
        result
    }

    async fn listen(&self, link: &dyn HeartRateLink, cancel: &CancellationToken) -> Result<()> {
        let mut notifications = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = link.subscribe_notifications(HEART_RATE_MEASUREMENT_UUID) => stream?,
        };

        self.set_state(SessionState::Subscribed);
        info!("Listening for heart rate data");

        let period = self.config.liveness_interval;
        let mut liveness = interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                notification = notifications.next() => match notification {
                    Some(payload) => self.handle_notification(&payload),
                    None => return Err(Error::ConnectionLost),
                },
                _ = liveness.tick() => {
                    if !link.is_connected().await {
                        return Err(Error::ConnectionLost);
                    }
                }
            }
        }
    }

    /// Best-effort unsubscribe and disconnect, bounded by the shutdown grace.
    async fn release(&self, link: &dyn HeartRateLink) {
        let teardown = async {
            if let Err(e) = link.unsubscribe(HEART_RATE_MEASUREMENT_UUID).await {
                debug!("Unsubscribe failed: {}", e);
            }
            if let Err(e) = link.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
        };

        if tokio::time::timeout(self.config.shutdown_grace, teardown)
            .await
            .is_err()
        {
            warn!(
                "BLE teardown did not finish within {:?}",
                self.config.shutdown_grace
            );
        }
    }

    /// Decode one notification and dispatch the sample. Malformed payloads are only reported.
    pub fn handle_notification(&self, payload: &[u8]) {
        match decode(payload) {
            Ok(bpm) => {
                let sample = HeartRateSample::new(bpm);
                debug!("Heart Rate: {}", sample);
                self.dispatcher.dispatch(sample);
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Malformed payload {:02X?}: {}", payload, e);
            }
        }
    }

    /// Update the state and log the transition.
    fn set_state(&self, new_state: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            debug!("Session state changed: {} -> {}", state, new_state);
            *state = new_state;
            true
        });
    }
}
