//! Bluetooth Module
//!
//! BLE central access to the CapSense/LED peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SessionStateMachine                     │
//! │        (owns lifecycle, cache and event fan-out)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Arc<dyn GattTransport>
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │   WinRT   │  │  btleplug  │  │ Simulated │
//! │ (Windows) │  │  (others)  │  │  (tests)  │
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service/characteristic UUIDs and payload formats
//! - [`transport`] - The [`GattTransport`] trait and its callbacks
//! - [`simulated`] - In-memory peripheral
//! - `winrt` - Windows radio
//! - `btle` - btleplug radio for Linux and macOS

#[cfg(not(windows))]
pub mod btle;
pub mod protocol;
pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use transport::{GattTransport, TransportConfig, TransportEvent};

/// The host's BLE radio
#[cfg(windows)]
pub type PlatformTransport = winrt::WinrtTransport;

/// The host's BLE radio
#[cfg(not(windows))]
pub type PlatformTransport = btle::BtleplugTransport;
