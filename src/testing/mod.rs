//! Testing utilities and mock implementations
//!
//! In-process broker and transport doubles for exercising agents without a
//! running MQTT broker.

pub mod mocks;

pub use mocks::*;
