//! Bluetooth Module
//!
//! Provides BLE communication with a LEGO WeDo 2.0 hub.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       HubSession                         │
//! │  (connection state machine - public API for callers)     │
//! └──────┬──────────────┬──────────────┬───────────┬────────┘
//!        │              │              │           │
//!        ▼              ▼              ▼           ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │  Parser  │  │ Detector │
//! │           │  │            │  │          │  │          │
//! │ - filter  │  │ - GATT     │  │ - port   │  │ - active │
//! │ - timeout │  │   table    │  │   events │  │   probes │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘  └──────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐    ┌──────────┐
//! │     BleAdapter (trait)      │    │ Protocol │
//! │  WinRT backend │ fake hub   │    │ - frames │
//! └─────────────────────────────┘    └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, frame encoders, sensor decoding
//! - [`parser`] - port attach/detach notifications
//! - [`adapter`] - radio abstraction
//! - [`scanner`] - hub discovery
//! - [`connection`] - connect, discovery, metadata, subscriptions
//! - [`service`] - the hub session
//! - [`detector`] - active device probing
//! - [`fake`] - in-process hub for tests and simulation

pub mod adapter;
pub mod connection;
pub mod detector;
pub mod error;
pub mod fake;
pub mod parser;
pub mod protocol;
pub mod scanner;
pub mod service;
#[cfg(windows)]
pub mod winrt;

pub use error::HubError;
pub use service::HubSession;
