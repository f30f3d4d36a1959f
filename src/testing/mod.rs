//! Testing utilities and mock implementations
//!
//! Lets the adapter and console session be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
