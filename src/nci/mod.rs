//! NFC Controller Interface decoding
//!
//! This module turns raw NCI packets into typed activation, discovery and
//! NFCEE action records, and routes them to registered listeners.

pub mod activation;
pub mod codec;
pub mod discovery;
pub mod dispatch;
pub mod ee_action;
pub mod reader;
pub mod rf_params;

pub use self::activation::{ActivationRecord, InterfaceParams};
pub use self::codec::{MessageType, NciCodec, NciPacket};
pub use self::discovery::{DiscoveryRecord, DiscoveryResultSet};
pub use self::dispatch::{DiscoverEvent, DiscoveryListener, NciDispatcher, ResponseEvent, ResponseListener};
pub use self::ee_action::{AppInitTag, AppInitTlv, EeAction, EeActionRecord};
pub use self::reader::PacketReader;
pub use self::rf_params::{RfTechParams, TechDetail};

/// Size of the NCI packet header
pub const MSG_HDR_SIZE: usize = 3;

/// Largest payload a single NCI segment can carry
pub const MAX_SEGMENT_PAYLOAD: usize = 0xFF;

/// NCI version 2.0, the first version with NFCEE enumeration for HCI access
pub const VERSION_2_0: u8 = 0x20;

/// Group identifiers
pub mod gid {
    pub const CORE: u8 = 0x00;
    pub const RF_MANAGE: u8 = 0x01;
    pub const EE_MANAGE: u8 = 0x02;
    pub const PROPRIETARY: u8 = 0x0F;
}

/// RF management opcodes
pub mod rf_oid {
    pub const DISCOVER_MAP: u8 = 0x00;
    pub const DISCOVER: u8 = 0x03;
    pub const DISCOVER_SELECT: u8 = 0x04;
    pub const INTF_ACTIVATED: u8 = 0x05;
    pub const DEACTIVATE: u8 = 0x06;
    pub const NFCEE_ACTION: u8 = 0x09;
    pub const NFCEE_DISCOVERY_REQ: u8 = 0x0A;
}

/// Static logical connections
pub mod conn_id {
    pub const STATIC_RF: u8 = 0x00;
    pub const STATIC_HCI: u8 = 0x01;
}

/// RF interface codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfInterface {
    EeDirect,
    Frame,
    IsoDep,
    NfcDep,
    Ndef,
    Mifare,
    Other(u8),
}

impl From<u8> for RfInterface {
    fn from(code: u8) -> Self {
        match code {
            0x00 => RfInterface::EeDirect,
            0x01 => RfInterface::Frame,
            0x02 => RfInterface::IsoDep,
            0x03 => RfInterface::NfcDep,
            0x06 => RfInterface::Ndef,
            0x80 => RfInterface::Mifare,
            other => RfInterface::Other(other),
        }
    }
}

/// RF protocol codes
///
/// Code 0x05 is shared by passive NFC-DEP and ISO 18092 active mode; both
/// decode to `NfcDep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfProtocol {
    Unknown,
    T1t,
    T2t,
    T3t,
    IsoDep,
    NfcDep,
    T5t,
    Mifare,
    Other(u8),
}

impl From<u8> for RfProtocol {
    fn from(code: u8) -> Self {
        match code {
            0x00 => RfProtocol::Unknown,
            0x01 => RfProtocol::T1t,
            0x02 => RfProtocol::T2t,
            0x03 => RfProtocol::T3t,
            0x04 => RfProtocol::IsoDep,
            0x05 => RfProtocol::NfcDep,
            0x06 => RfProtocol::T5t,
            0x80 => RfProtocol::Mifare,
            other => RfProtocol::Other(other),
        }
    }
}

/// RF technology and mode codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfTechMode {
    PollA,
    PollB,
    PollF,
    PollActive,
    PollV,
    ListenA,
    ListenB,
    ListenF,
    ListenActive,
    Other(u8),
}

impl RfTechMode {
    /// Returns true for the listen-side modes
    pub fn is_listen(&self) -> bool {
        matches!(
            self,
            RfTechMode::ListenA | RfTechMode::ListenB | RfTechMode::ListenF | RfTechMode::ListenActive
        )
    }
}

impl From<u8> for RfTechMode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => RfTechMode::PollA,
            0x01 => RfTechMode::PollB,
            0x02 => RfTechMode::PollF,
            0x03 => RfTechMode::PollActive,
            0x06 => RfTechMode::PollV,
            0x80 => RfTechMode::ListenA,
            0x81 => RfTechMode::ListenB,
            0x82 => RfTechMode::ListenF,
            0x83 => RfTechMode::ListenActive,
            other => RfTechMode::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(RfInterface::from(0x02), RfInterface::IsoDep);
        assert_eq!(RfInterface::from(0x42), RfInterface::Other(0x42));
        assert_eq!(RfProtocol::from(0x05), RfProtocol::NfcDep);
        assert_eq!(RfTechMode::from(0x81), RfTechMode::ListenB);
        assert!(RfTechMode::ListenF.is_listen());
        assert!(!RfTechMode::PollV.is_listen());
    }
}
