//! `gv50` is a fleet ingestion server for the Queclink `@Track` ASCII
//! telematics protocol spoken by GV50-class GPS asset trackers.
//!
//! Devices hold a long-lived TCP connection to the server and push location
//! reports, ignition/power/motion events, battery telemetry and heartbeats.
//! The reply slot on each inbound frame is the server's only opportunity to
//! push outbound control commands (block/unblock, server migration) and
//! notifications back to the device — see [`dispatcher`] for why that makes
//! heartbeat cadence the primary command-latency lever.
//!
//! Module map, leaf to root:
//!
//! - [`codec`] — frame boundary detection and ACK/command synthesis.
//! - [`parser`] — positional decoding of a frame into a typed [`parser::ParsedMessage`].
//! - [`model`] — the persisted `Device`/`TelemetrySample`/`Customer` rows.
//! - [`reducer`] — the per-IMEI pure function that turns a parsed message
//!   plus the current device row into persistence writes, notification
//!   intents and an optional outbound command intent.
//! - [`registry`] — the process-wide map of live connections, keyed by IMEI
//!   and by connection id, plus the stale-connection sweeper.
//! - [`dispatcher`] — in-flight-per-IMEI command gating and AT frame
//!   synthesis.
//! - [`connection`] — the per-connection task tying the above together.
//! - [`store`] / [`notify`] — the external collaborator contracts, each with
//!   an in-process reference implementation.
//! - [`config`] — typed, file+env+CLI configuration.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod model;
pub mod notify;
pub mod parser;
pub mod reducer;
pub mod registry;
pub mod store;
