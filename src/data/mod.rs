//! Data structures for sensor readings.

pub mod sample;

pub use sample::{HeartRateSample, TIMESTAMP_FORMAT};
