//! Heart-rate sample data structures.

use chrono::{DateTime, Local};
use std::fmt;

/// Timestamp format used for log rows.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single decoded heart-rate reading.
///
/// Created once per successfully decoded notification and never modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeartRateSample {
    /// Heart rate in beats per minute.
    pub bpm: u16,

    /// Local time at which the notification was decoded.
    pub observed_at: DateTime<Local>,
}

impl HeartRateSample {
    /// Create a sample observed now.
    pub fn new(bpm: u16) -> Self {
        Self::at(bpm, Local::now())
    }

    /// Create a sample with an explicit observation time.
    pub fn at(bpm: u16, observed_at: DateTime<Local>) -> Self {
        Self { bpm, observed_at }
    }

    /// The observation time formatted for log rows.
    pub fn timestamp_string(&self) -> String {
        self.observed_at.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Format the sample as a `timestamp,bpm` CSV row (no trailing newline).
    pub fn to_csv_row(&self) -> String {
        format!("{},{}", self.timestamp_string(), self.bpm)
    }
}

impl fmt::Display for HeartRateSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bpm", self.bpm)
    }
}
