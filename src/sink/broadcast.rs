//! TCP fan-out of the latest heart rate.
//!
//! Every connected client receives the latest bpm as an ASCII decimal line
//! once per broadcast period, whether or not the value changed.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dispatch::LatestSample;
use crate::error::{Error, Result};
use crate::sink::registry::{BroadcastReport, Subscriber, SubscriberRegistry};

/// Timing and queueing parameters for the broadcast server.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Interval between pushes to subscribers.
    pub period: Duration,
    /// Longest a single write may stall before the subscriber is dropped.
    pub stall_timeout: Duration,
    /// Lines buffered per subscriber before ticks are skipped for it.
    pub queue_capacity: usize,
    /// Time allowed for connection tasks to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(15),
            queue_capacity: 8,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pending connections queued by the OS.
const LISTEN_BACKLOG: u32 = 1024;

/// Format a bpm value for the wire.
pub fn encode_line(bpm: u16) -> Bytes {
    Bytes::from(format!("{}\n", bpm))
}

/// Listening TCP server that pushes the latest value to every subscriber.
pub struct BroadcastServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: SubscriberRegistry,
    latest: LatestSample,
    config: BroadcastConfig,
}

impl BroadcastServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        latest: LatestSample,
        config: BroadcastConfig,
    ) -> Result<Self> {
        let listener = bind_listener(addr).map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!("Broadcasting heart rate on tcp://{}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            registry: SubscriberRegistry::new(),
            latest,
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the subscriber set.
    pub fn registry(&self) -> SubscriberRegistry {
        self.registry.clone()
    }

    /// Push the latest value to every subscriber.
    ///
    /// Returns `None` when nobody is connected.
    pub fn broadcast_latest(&self) -> Option<BroadcastReport> {
        if self.registry.is_empty() {
            return None;
        }

        let bpm = self.latest.bpm_or_zero();
        let report = self.registry.broadcast(encode_line(bpm));
        trace!("Broadcast {} bpm: {:?}", bpm, report);
        Some(report)
    }

    /// Accept subscribers and broadcast until `cancel` fires, then close every subscriber.
    pub async fn run(self, cancel: CancellationToken) {
        let mut connections = JoinSet::new();

        let mut ticker = interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (subscriber, outbound) =
                            self.registry.register(peer, self.config.queue_capacity);
                        info!(
                            "Subscriber {} connected ({} total)",
                            peer,
                            self.registry.len()
                        );
                        connections.spawn(serve_subscriber(
                            stream,
                            subscriber,
                            outbound,
                            self.registry.clone(),
                            self.config.stall_timeout,
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept subscriber: {}", e);
                        if !pause_after_accept_error(&cancel).await {
                            break;
                        }
                    }
                },
                _ = ticker.tick() => {
                    self.broadcast_latest();
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Subscriber task ended abnormally: {}", e);
                    }
                }
            }
        }

        drop(self.listener);
        let closed = self.registry.close_all();
        info!("Broadcast listener stopped, closed {} subscriber(s)", closed);

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Subscriber tasks did not finish in time, aborting");
            connections.abort_all();
        }
    }
}

/// Bind a listener whose accepted connections carry TCP keepalive.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Wait before the next `accept`. Returns `false` if cancelled meanwhile.
async fn pause_after_accept_error(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

/// Per-connection task: owns the transport, writes queued lines, notices when the peer goes away.
async fn serve_subscriber(
    stream: TcpStream,
    subscriber: Arc<Subscriber>,
    mut outbound: mpsc::Receiver<Bytes>,
    registry: SubscriberRegistry,
    stall_timeout: Duration,
) {
    let peer = subscriber.peer();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut inbound = [0u8; 256];

    let reason = loop {
        tokio::select! {
            biased;
            _ = subscriber.closed() => break "closed",
            line = outbound.recv() => match line {
                Some(line) => {
                    let write = tokio::time::timeout(stall_timeout, writer.write_all(&line));
                    tokio::select! {
                        biased;
                        _ = subscriber.closed() => break "closed",
                        written = write => match written {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!("Write to {} failed: {}", peer, e);
                                break "write failed";
                            }
                            Err(_) => break "write stalled",
                        },
                    }
                }
                None => break "queue closed",
            },
            read = reader.read(&mut inbound) => match read {
                Ok(0) => break "peer closed",
                Ok(n) => trace!("Ignoring {} bytes from subscriber {}", n, peer),
                Err(e) => {
                    debug!("Read from {} failed: {}", peer, e);
                    break "read failed";
                }
            },
        }
    };

    if registry.remove(subscriber.id()).is_some() {
        info!("Subscriber {} disconnected ({})", peer, reason);
    }

    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of {} failed: {}", peer, e);
    }
}
