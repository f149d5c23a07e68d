//! RF discovery notifications
//!
//! Each `RF_DISCOVER_NTF` reports one target. The trailing notification type
//! byte tells whether more targets follow, so a full discovery round is the
//! chain of records up to the first one without `more`.

use super::reader::PacketReader;
use super::rf_params::RfTechParams;
use super::{RfProtocol, RfTechMode, MSG_HDR_SIZE};
use crate::core::Result;

/// One discovered target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub rf_disc_id: u8,
    pub protocol: RfProtocol,
    pub rf_tech: RfTechParams,
    /// More notifications follow in this discovery round
    pub more: bool,
}

/// Decodes a discovery notification.
///
/// `packet` still carries the 3-byte NCI header, which is skipped.
pub fn decode(packet: &[u8]) -> Result<DiscoveryRecord> {
    let mut reader = PacketReader::new(packet);
    reader.skip(MSG_HDR_SIZE)?;

    let rf_disc_id = reader.read_u8()?;
    let protocol = RfProtocol::from(reader.read_u8()?);
    let mode = RfTechMode::from(reader.read_u8()?);
    let rf_tech = RfTechParams::new(mode, reader.read_len_prefixed()?);
    let more = reader.read_u8()? != 0;

    Ok(DiscoveryRecord {
        rf_disc_id,
        protocol,
        rf_tech,
        more,
    })
}

/// Accumulates chained discovery records into one result set
#[derive(Debug, Default)]
pub struct DiscoveryResultSet {
    records: Vec<DiscoveryRecord>,
}

impl DiscoveryResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record; returns the completed round once a record without
    /// `more` arrives.
    pub fn push(&mut self, record: DiscoveryRecord) -> Option<Vec<DiscoveryRecord>> {
        let last = !record.more;
        self.records.push(record);
        if last {
            Some(std::mem::take(&mut self.records))
        } else {
            None
        }
    }

    /// Drops a partially received round
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn pending(&self) -> usize {
        self.records.len()
    }
}
