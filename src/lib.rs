//! NFC HCI: NCI notification decoding and the HCI host-control layer
//!
//! This library decodes the RF management notifications an NFC controller
//! sends over NCI and runs the Host Controller Interface state machine that
//! manages gates and pipes between the device host and secure elements.
pub mod core;
pub mod hci;
pub mod nci;
pub mod service;
pub mod transport;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Error, Result};
pub use crate::service::{ConfigStore, HciService, MemoryStore, ServiceHandle, ServiceInput};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
