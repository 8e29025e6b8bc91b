//! bwprobe - bottleneck bandwidth and latency estimation
//!
//! This library estimates the bottleneck bandwidth of a network path by
//! sending a back-to-back train of UDP probe packets and measuring the
//! inter-packet spacing observed on each side. The narrowest link on the
//! path spreads the train out, so the receive-side spacing approximates
//! the bottleneck capacity.
//!
//! # Features
//!
//! - Packet-train bandwidth estimation (send-side and receive-side)
//! - Session handshake with bounded retries
//! - Report mode (responder returns one averaged interval) and echo mode
//!   (responder stamps every probe, enabling latency estimates)
//! - Asynchronous I/O using tokio

pub mod client;
pub mod config;
pub mod error;
pub mod estimate;
pub mod handshake;
pub mod server;
pub mod session;
pub mod wire;

pub use client::Prober;
pub use config::{Config, ResponderMode, RetryPolicy};
pub use error::{Error, Result};
pub use estimate::ProbeReport;
pub use server::Responder;
pub use session::{Sample, SampleSet, Session};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
