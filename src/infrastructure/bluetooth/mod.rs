//! Bluetooth Module
//!
//! GATT client session management over an abstract transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │        (one BleDevice per peer, persisted peers)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┬──────────────┐
//!         │             │              │              │
//!         ▼             ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌───────────┐
//! │ Connection │ │   Queue    │ │  Registry   │ │ EventBus  │
//! │            │ │            │ │             │ │           │
//! │ - states   │ │ - ordering │ │ - factories │ │ - weak    │
//! │ - epochs   │ │ - deadlines│ │ - lookups   │ │   observers│
//! │ - close    │ │ - late     │ │ - handles   │ │ - dispatch│
//! │   debounce │ │   results  │ │             │ │           │
//! └─────┬──────┘ └─────┬──────┘ └─────────────┘ └───────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────┐
//! │  Transport / Sink       │
//! └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`connection`] - Per-peer state machine and operation entry points
//! - [`queue`] - Serialized command execution with deadlines
//! - [`registry`] - Per-epoch attribute index built from discovery
//! - [`factory`] - Service handler selection
//! - [`gatt`] - Characteristic, descriptor and service model
//! - [`services`] - Typed handlers for standard services
//! - [`observer`] - Weakly held observers and dispatch
//! - [`transport`] - Platform boundary
//! - [`protocol`] - UUIDs, descriptor values and byte decoding
//! - [`service`] - Main service coordinator
//! - [`testing`] - Scriptable transport for tests

pub mod connection;
pub mod events;
pub mod factory;
pub mod gatt;
pub mod observer;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod service;
pub mod services;
pub mod testing;
pub mod transport;

// Re-export main types for convenience
pub use connection::{BleDevice, GattClient};
pub use service::BluetoothService;
