//! Consumers of the decoded heart-rate stream.
//!
//! Every sink runs on its own worker task behind a bounded queue (see
//! [`SinkHandle`]), so a slow or failing sink never holds up the device
//! session or the other sinks.

pub mod broadcast;
pub mod console;
pub mod file;
pub mod log;
pub mod registry;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::data::HeartRateSample;
use crate::error::Result;

pub use broadcast::{BroadcastConfig, BroadcastServer};
pub use console::ConsoleSink;
pub use file::FileSink;
pub use log::LogSink;
pub use registry::{BroadcastReport, PushError, Subscriber, SubscriberId, SubscriberRegistry};

/// A consumer of heart-rate samples.
#[async_trait]
pub trait Sink: Send {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Consume one sample.
    async fn deliver(&mut self, sample: &HeartRateSample) -> Result<()>;

    /// Flush and release underlying resources.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Owner of a sink's worker task and the sending side of its queue.
pub struct SinkHandle {
    name: String,
    tx: mpsc::Sender<HeartRateSample>,
    worker: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

impl SinkHandle {
    /// Default queue depth per sink.
    pub const DEFAULT_CAPACITY: usize = 32;

    /// Move `sink` onto its own worker task fed by a queue of `capacity` samples.
    pub fn spawn(mut sink: Box<dyn Sink>, capacity: usize) -> Self {
        let name = sink.name().to_string();
        let (tx, mut rx) = mpsc::channel::<HeartRateSample>(capacity.max(1));

        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                if let Err(e) = sink.deliver(&sample).await {
                    warn!("{} sink failed to write {}: {}", worker_name, sample, e);
                }
            }

            if let Err(e) = sink.close().await {
                warn!("{} sink failed to close: {}", worker_name, e);
            }
            debug!("{} sink closed", worker_name);
        });

        Self {
            name,
            tx,
            worker,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the sink's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a sample without waiting.
    ///
    /// Returns `false` if the sample was dropped because the queue is full
    /// or the worker has gone away.
    pub fn deliver(&self, sample: HeartRateSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(TrySendError::Full(sample)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("{} sink is falling behind, dropping {}", self.name, sample);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("{} sink worker is gone", self.name);
                false
            }
        }
    }

    /// Number of samples this sink has not received.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait up to `grace` for the worker to drain it.
    pub async fn close(self, grace: Duration) {
        let Self {
            name, tx, worker, ..
        } = self;
        drop(tx);

        let abort = worker.abort_handle();
        match tokio::time::timeout(grace, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} sink worker ended abnormally: {}", name, e),
            Err(_) => {
                warn!("{} sink did not close within {:?}", name, grace);
                abort.abort();
            }
        }
    }
}
