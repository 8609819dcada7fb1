//! # SafetyLink Core Library
//!
//! Host-side engine for the Safety Printer MCU, the board that watches a 3D
//! printer's safety sensors and cuts power through an interlock.
//!
//! This library provides:
//! - The MCU serial protocol: framing, CRC-16 checksums, single-flight
//!   command exchange with retry
//! - The connection lifecycle: discovery, handshake, firmware negotiation
//! - A sensor state model that turns status polls into change notifications
//! - A periodic poller and a simulated MCU for demo mode
//! - An abortable shutdown countdown that powers the printer off after a print
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use safetylink_core::prelude::*;
//!
//! let config = LinkConfig::load_or_default("safetylink.json")?;
//! let notifier = Notifier::new(Arc::new(RecordingSink::new()), config.notify.clone());
//! let monitor = Arc::new(SafetyMonitor::with_serial(config, Arc::new(NoHost), notifier));
//!
//! monitor.connect()?;
//! let poller = Poller::start(monitor.clone(), monitor.connection().config().poll_interval());
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod demo;
pub mod events;
pub mod host;
pub mod monitor;
pub mod poller;
pub mod protocol;
pub mod sensors;
pub mod shutdown;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LinkConfig, PortSelection, ShutdownConfig};
    pub use crate::demo::{SimulatedBackend, SimulatedMcu};
    pub use crate::events::{
        Notification, NotificationSink, Notifier, PushNotifier, RecordingSink, Severity,
    };
    pub use crate::host::{HostConnection, HostPrinter, NoHost};
    pub use crate::monitor::SafetyMonitor;
    pub use crate::poller::Poller;
    pub use crate::protocol::{
        Command, Connection, ConnectionState, FirmwareInfo, Flag, LinkState, ProtocolError,
        ProtocolMode,
    };
    pub use crate::sensors::{BoardWarning, SensorRecord, StatusOutcome};
    pub use crate::shutdown::{PrintOutcome, ShutdownTimer};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
