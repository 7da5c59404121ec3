//! # fixrelay-core
//!
//! Core data model and ingestion logic for the BLE fix relay.
//!
//! This crate provides:
//! - Data model types (Device, FixRecord, OutboxEntry)
//! - NMEA 0183 sentence parsing
//! - Line reassembly and fix aggregation
//! - Per-device sessions and the connection state machine
//! - Configuration loading
//!
//! This crate is intentionally runtime-agnostic and contains no async code;
//! BLE and network I/O live in the `fixrelay-ble` and `fixrelay-relay` crates.

pub mod aggregator;
pub mod config;
pub mod device;
pub mod model;
pub mod nmea;
pub mod reassembly;
pub mod session;

pub use aggregator::{NmeaFixAggregator, PartialFix, DEFAULT_FIX_QUALITY_THRESHOLD};
pub use config::{ConfigError, RelayConfig};
pub use device::{DeviceEvent, DeviceRegistry, Discovery, TransitionError};
pub use model::*;
pub use reassembly::SentenceReassembler;
pub use session::{DeviceSession, SessionHandler};
