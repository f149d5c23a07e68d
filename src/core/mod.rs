//! Core types shared by the NCI decoders and the host-control state machine
//!
//! This module contains the error type, status codes and identifiers used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    AppHandle,
    GateId,
    HostId,
    NfceeId,
    PipeId,
    PowerMode,
    SessionId,
    Status,
};
