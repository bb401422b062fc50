//! Protocol module for decoding sensor notifications.

pub mod heart_rate;

pub use heart_rate::{decode, DecodeError, ValueFormat};
