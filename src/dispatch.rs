//! Latest-value tracking and fan-out of samples to sinks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::data::HeartRateSample;
use crate::sink::SinkHandle;

/// The most recent decoded sample, shared between the session and readers.
///
/// Cloning shares the same value.
#[derive(Clone)]
pub struct LatestSample {
    tx: Arc<watch::Sender<Option<HeartRateSample>>>,
}

impl LatestSample {
    /// Start with no sample.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Get the latest sample, if any has been received.
    pub fn get(&self) -> Option<HeartRateSample> {
        *self.tx.borrow()
    }

    /// Latest bpm, or 0 before the first sample.
    pub fn bpm_or_zero(&self) -> u16 {
        self.get().map(|s| s.bpm).unwrap_or(0)
    }

    /// Replace the latest sample.
    pub fn update(&self, sample: HeartRateSample) {
        self.tx.send_replace(Some(sample));
    }

    /// Watch for new samples.
    pub fn subscribe(&self) -> watch::Receiver<Option<HeartRateSample>> {
        self.tx.subscribe()
    }
}

impl Default for LatestSample {
    fn default() -> Self {
        Self::new()
    }
}

/// Single entry point for decoded samples.
///
/// Records the sample as the latest value, then queues it for every
/// registered sink without blocking.
pub struct SampleDispatcher {
    latest: LatestSample,
    sinks: Mutex<Vec<SinkHandle>>,
    dispatched: AtomicU64,
}

impl SampleDispatcher {
    /// Create a dispatcher writing to `latest`.
    pub fn new(latest: LatestSample) -> Self {
        Self {
            latest,
            sinks: Mutex::new(Vec::new()),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Get the shared latest-sample handle.
    pub fn latest(&self) -> &LatestSample {
        &self.latest
    }

    /// Register a sink.
    pub fn add_sink(&self, sink: SinkHandle) {
        debug!("Registered {} sink", sink.name());
        self.sinks.lock().push(sink);
    }

    /// Names of the registered sinks.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks
            .lock()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Number of samples dispatched so far.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Publish a sample.
    pub fn dispatch(&self, sample: HeartRateSample) {
        self.latest.update(sample);
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        for sink in self.sinks.lock().iter() {
            sink.deliver(sample);
        }
    }

    /// Detach every sink and wait for each to drain, up to `grace` per sink.
    pub async fn close_sinks(&self, grace: Duration) {
        let sinks = std::mem::take(&mut *self.sinks.lock());
        for sink in sinks {
            sink.close(grace).await;
        }
    }
}
