//! Core of the community group bot: message fan-out over the Blaze bus, red
//! packets and payouts.
//!
//! Framework-agnostic. The websocket, payments API and persistence live
//! behind ports (traits) implemented in adapter crates.

pub mod announce;
pub mod blaze;
pub mod config;
pub mod digest;
pub mod dispatcher;
pub mod distribution;
pub mod domain;
pub mod errors;
pub mod inbound;
pub mod logging;
pub mod packet;
pub mod payouts;
pub mod ports;
pub mod service;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
