//! RF technology specific parameters
//!
//! Activation and discovery notifications both carry a length-prefixed
//! parameter blob whose layout depends on the RF technology and mode. The
//! blob is kept raw on the record and decoded on demand.

use super::reader::PacketReader;
use super::RfTechMode;
use crate::core::{Error, Result};

/// Maximum NFCID1 length
pub const MAX_NFCID1_LEN: usize = 10;
/// Maximum SENSB_RES length
pub const MAX_SENSB_RES_LEN: usize = 12;
/// Maximum SENSF_RES length
pub const MAX_SENSF_RES_LEN: usize = 18;
/// NFCID2 length
pub const NFCID2_LEN: usize = 8;
/// T5T UID length
pub const T5T_UID_LEN: usize = 8;
/// T1T HR length
pub const T1T_HR_LEN: usize = 2;

/// RF technology parameters of a discovered or activated endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfTechParams {
    /// Technology and mode the parameters belong to
    pub mode: RfTechMode,
    /// Parameter blob as received
    pub raw: Vec<u8>,
    /// T1T HR bytes carried by the frame interface activation parameters
    pub hr: Vec<u8>,
}

/// Decoded view of `RfTechParams::raw`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TechDetail {
    PollA {
        sens_res: [u8; 2],
        nfcid1: Vec<u8>,
        sel_res: Option<u8>,
    },
    PollB {
        sensb_res: Vec<u8>,
    },
    PollF {
        bit_rate: u8,
        sensf_res: Vec<u8>,
    },
    ListenF {
        nfcid2: Vec<u8>,
    },
    PollV {
        res_flag: u8,
        dsfid: u8,
        uid: [u8; T5T_UID_LEN],
    },
    /// Modes that carry no technology parameters
    None,
}

impl RfTechParams {
    pub fn new(mode: RfTechMode, raw: &[u8]) -> Self {
        RfTechParams {
            mode,
            raw: raw.to_vec(),
            hr: Vec::new(),
        }
    }

    /// Decodes the raw blob for the technology in `mode`
    pub fn decode_detail(&self) -> Result<TechDetail> {
        let mut reader = PacketReader::new(&self.raw);
        let detail = match self.mode {
            RfTechMode::PollA => {
                let sens_res = reader.read_array::<2>()?;
                let nfcid1 = bounded(reader.read_len_prefixed()?, MAX_NFCID1_LEN, "NFCID1")?;
                let sel_res = match reader.read_len_prefixed() {
                    Ok(sel) => sel.first().copied(),
                    Err(_) => None,
                };
                TechDetail::PollA { sens_res, nfcid1, sel_res }
            }
            RfTechMode::PollB => TechDetail::PollB {
                sensb_res: bounded(reader.read_len_prefixed()?, MAX_SENSB_RES_LEN, "SENSB_RES")?,
            },
            RfTechMode::PollF => {
                let bit_rate = reader.read_u8()?;
                let sensf_res = bounded(reader.read_len_prefixed()?, MAX_SENSF_RES_LEN, "SENSF_RES")?;
                TechDetail::PollF { bit_rate, sensf_res }
            }
            RfTechMode::ListenF => TechDetail::ListenF {
                nfcid2: bounded(reader.read_len_prefixed()?, NFCID2_LEN, "NFCID2")?,
            },
            RfTechMode::PollV => TechDetail::PollV {
                res_flag: reader.read_u8()?,
                dsfid: reader.read_u8()?,
                uid: reader.read_array::<T5T_UID_LEN>()?,
            },
            _ => TechDetail::None,
        };
        Ok(detail)
    }
}

fn bounded(field: &[u8], max: usize, name: &str) -> Result<Vec<u8>> {
    if field.len() > max {
        return Err(Error::malformed(format!(
            "{} length {} exceeds {}",
            name,
            field.len(),
            max
        )));
    }
    Ok(field.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_a_detail() {
        let raw = [0x44, 0x00, 0x07, 0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x01, 0x20];
        let params = RfTechParams::new(RfTechMode::PollA, &raw);
        match params.decode_detail().unwrap() {
            TechDetail::PollA { sens_res, nfcid1, sel_res } => {
                assert_eq!(sens_res, [0x44, 0x00]);
                assert_eq!(nfcid1, vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
                assert_eq!(sel_res, Some(0x20));
            }
            other => panic!("unexpected detail {:?}", other),
        }
    }

    #[test]
    fn test_poll_a_without_sel_res() {
        let raw = [0x04, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04];
        let params = RfTechParams::new(RfTechMode::PollA, &raw);
        assert!(matches!(
            params.decode_detail().unwrap(),
            TechDetail::PollA { sel_res: None, .. }
        ));
    }

    #[test]
    fn test_oversized_nfcid1_is_malformed() {
        let mut raw = vec![0x44, 0x00, 0x0B];
        raw.extend_from_slice(&[0u8; 11]);
        let params = RfTechParams::new(RfTechMode::PollA, &raw);
        assert!(params.decode_detail().unwrap_err().is_malformed());
    }

    #[test]
    fn test_poll_f_and_v_detail() {
        let mut raw = vec![0x01, 0x10];
        raw.extend_from_slice(&[0xAB; 16]);
        let params = RfTechParams::new(RfTechMode::PollF, &raw);
        assert!(matches!(
            params.decode_detail().unwrap(),
            TechDetail::PollF { bit_rate: 0x01, ref sensf_res } if sensf_res.len() == 16
        ));

        let raw = [0x00, 0x00, 1, 2, 3, 4, 5, 6, 7, 8];
        let params = RfTechParams::new(RfTechMode::PollV, &raw);
        assert_eq!(
            params.decode_detail().unwrap(),
            TechDetail::PollV { res_flag: 0, dsfid: 0, uid: [1, 2, 3, 4, 5, 6, 7, 8] }
        );
    }

    #[test]
    fn test_truncated_poll_v() {
        let params = RfTechParams::new(RfTechMode::PollV, &[0x00, 0x00, 0x01]);
        assert!(params.decode_detail().is_err());
    }

    #[test]
    fn test_listen_modes_without_params() {
        let params = RfTechParams::new(RfTechMode::ListenA, &[]);
        assert_eq!(params.decode_detail().unwrap(), TechDetail::None);
    }
}
