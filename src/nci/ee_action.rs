//! NFCEE action notifications
//!
//! Decodes `RF_NFCEE_ACTION_NTF` payloads: the NFCEE id, the trigger that
//! caused the action and the trigger specific data.

use super::reader::PacketReader;
use crate::core::{Error, NfceeId, Result};

/// Maximum AID length
pub const MAX_AID_LEN: usize = 16;

/// Trigger codes
pub mod trigger {
    pub const SELECT_7816: u8 = 0x00;
    pub const RF_PROTOCOL: u8 = 0x01;
    pub const RF_TECHNOLOGY: u8 = 0x02;
    pub const APP_INIT: u8 = 0x10;
}

/// Tags of the application-init TLV block
pub mod tag {
    pub const AID: u8 = 0xC0;
    pub const DATA: u8 = 0xC1;
}

/// An action an NFCEE took on an RF event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EeActionRecord {
    pub nfcee_id: NfceeId,
    /// Raw trigger code
    pub trigger: u8,
    pub action: EeAction,
}

/// Trigger specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EeAction {
    /// ISO 7816 SELECT with this AID
    Select7816 { aid: Vec<u8> },
    /// RF protocol that caused the routing decision
    RfProtocol(u8),
    /// RF technology that caused the routing decision
    RfTechnology(u8),
    /// Application initiation, TLV entries in packet order
    AppInit { entries: Vec<AppInitTlv> },
    /// Trigger without a typed decoding
    Unrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppInitTag {
    Aid,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInitTlv {
    pub tag: AppInitTag,
    pub value: Vec<u8>,
}

impl EeAction {
    /// AID of a SELECT or of the first AID entry of an application init
    pub fn aid(&self) -> Option<&[u8]> {
        match self {
            EeAction::Select7816 { aid } => Some(aid),
            EeAction::AppInit { entries } => entries
                .iter()
                .find(|e| e.tag == AppInitTag::Aid)
                .map(|e| e.value.as_slice()),
            _ => None,
        }
    }

    /// First DATA entry of an application init
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            EeAction::AppInit { entries } => entries
                .iter()
                .find(|e| e.tag == AppInitTag::Data)
                .map(|e| e.value.as_slice()),
            _ => None,
        }
    }
}

/// Decodes an NFCEE action payload
pub fn decode(payload: &[u8]) -> Result<EeActionRecord> {
    let mut reader = PacketReader::new(payload);
    let nfcee_id = reader.read_u8()?;
    let trigger = reader.read_u8()?;
    let data = reader.read_len_prefixed()?;

    let action = match trigger {
        trigger::SELECT_7816 => EeAction::Select7816 {
            aid: data[..data.len().min(MAX_AID_LEN)].to_vec(),
        },
        trigger::RF_PROTOCOL => EeAction::RfProtocol(first_byte(data, "RF protocol")?),
        trigger::RF_TECHNOLOGY => EeAction::RfTechnology(first_byte(data, "RF technology")?),
        trigger::APP_INIT => EeAction::AppInit {
            entries: walk_app_init(data),
        },
        _ => EeAction::Unrecognized,
    };

    Ok(EeActionRecord {
        nfcee_id,
        trigger,
        action,
    })
}

fn first_byte(data: &[u8], what: &str) -> Result<u8> {
    data.first()
        .copied()
        .ok_or_else(|| Error::malformed(format!("{} trigger without data", what)))
}

// Stops quietly at the first entry that does not fit; unknown tags are skipped.
fn walk_app_init(data: &[u8]) -> Vec<AppInitTlv> {
    let mut reader = PacketReader::new(data);
    let mut entries = Vec::new();
    while reader.remaining() >= 2 {
        let Ok(tag) = reader.read_u8() else { break };
        let Ok(value) = reader.read_len_prefixed() else { break };
        let tag = match tag {
            tag::AID => AppInitTag::Aid,
            tag::DATA => AppInitTag::Data,
            _ => continue,
        };
        entries.push(AppInitTlv {
            tag,
            value: value.to_vec(),
        });
    }
    entries
}
