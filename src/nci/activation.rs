//! RF interface activation notifications
//!
//! Decodes `RF_INTF_ACTIVATED_NTF` payloads into an `ActivationRecord`. The
//! interface specific parameters are selected by the (interface, protocol,
//! mode) triple of the header.

use super::reader::PacketReader;
use super::rf_params::{RfTechParams, T1T_HR_LEN};
use super::{RfInterface, RfProtocol, RfTechMode};
use crate::core::{Error, Result};

/// Maximum ATS length
pub const MAX_ATS_LEN: usize = 60;
/// Maximum ATTRIB command and response length
pub const MAX_ATTRIB_LEN: usize = 64;
/// Maximum ATR_REQ / ATR_RES length
pub const MAX_ATR_LEN: usize = 64;
/// NFCID0 length
pub const NFCID0_LEN: usize = 4;
/// Offset of the general bytes inside ATR_RES
pub const ATR_RES_GEN_BYTES_OFFSET: usize = 15;
/// Offset of the general bytes inside ATR_REQ
pub const ATR_REQ_GEN_BYTES_OFFSET: usize = 14;

/// A remote endpoint activated by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    /// RF discovery id of the activated endpoint
    pub rf_disc_id: u8,
    pub interface: RfInterface,
    /// Protocol, with ISO 18092 active folded into `NfcDep`
    pub protocol: RfProtocol,
    /// Technology parameters, including T1T HR bytes
    pub rf_tech: RfTechParams,
    /// Maximum data packet payload size on the static RF connection
    pub max_payload_size: u8,
    /// Initial number of credits
    pub initial_credits: u8,
    /// Data exchange technology and mode
    pub data_mode: u8,
    pub tx_bitrate: u8,
    pub rx_bitrate: u8,
    /// Interface specific activation parameters
    pub interface_params: InterfaceParams,
}

/// Activation parameters specific to the activated interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceParams {
    /// ISO-DEP in Poll-A: the ATS received from the card
    IsoDepPollA { ats: Vec<u8> },
    /// ISO-DEP in Listen-A: parameter byte of the RATS command
    IsoDepListenA { rats: u8 },
    /// ISO-DEP in Poll-B: the ATTRIB response
    IsoDepPollB { attrib_res: Vec<u8> },
    /// ISO-DEP in Listen-B: the ATTRIB command and the NFCID0 it carries
    IsoDepListenB { attrib_req: Vec<u8>, nfcid0: [u8; NFCID0_LEN] },
    /// NFC-DEP in a poll mode: ATR_RES and its general bytes
    NfcDepPoll { atr_res: Vec<u8>, general_bytes: Vec<u8> },
    /// NFC-DEP in a listen mode: ATR_REQ and its general bytes
    NfcDepListen { atr_req: Vec<u8>, general_bytes: Vec<u8> },
    /// Frame interface; T1T HR bytes live in `rf_tech.hr`
    Frame,
    /// The activation carried no interface parameters
    Empty,
    /// Combination without a typed decoding; bytes kept as received
    Unparsed(Vec<u8>),
}

/// Decodes an activation notification payload.
///
/// Any field that would read past the payload fails the whole notification.
pub fn decode(payload: &[u8]) -> Result<ActivationRecord> {
    let mut reader = PacketReader::new(payload);

    let rf_disc_id = reader.read_u8()?;
    let interface = RfInterface::from(reader.read_u8()?);
    let protocol = RfProtocol::from(reader.read_u8()?);
    let mode = RfTechMode::from(reader.read_u8()?);
    let max_payload_size = reader.read_u8()?;
    let initial_credits = reader.read_u8()?;
    let mut rf_tech = RfTechParams::new(mode, reader.read_len_prefixed()?);
    let data_mode = reader.read_u8()?;
    let tx_bitrate = reader.read_u8()?;
    let rx_bitrate = reader.read_u8()?;
    let act_len = reader.read_u8()? as usize;

    let interface_params = if act_len == 0 {
        InterfaceParams::Empty
    } else {
        match interface {
            RfInterface::IsoDep => decode_iso_dep(&mut reader, mode, act_len)?,
            RfInterface::NfcDep => decode_nfc_dep(&mut reader, mode)?,
            RfInterface::Frame if protocol == RfProtocol::T1t => {
                if act_len > T1T_HR_LEN {
                    return Err(Error::malformed(format!("T1T HR length {}", act_len)));
                }
                rf_tech.hr = reader.read_bytes(act_len)?.to_vec();
                InterfaceParams::Frame
            }
            _ => InterfaceParams::Unparsed(reader.read_bytes(act_len)?.to_vec()),
        }
    };

    Ok(ActivationRecord {
        rf_disc_id,
        interface,
        protocol,
        rf_tech,
        max_payload_size,
        initial_credits,
        data_mode,
        tx_bitrate,
        rx_bitrate,
        interface_params,
    })
}

// The ISO-DEP field is length prefixed on its own; that length is checked
// against the bytes actually present rather than the activation length.
fn decode_iso_dep(reader: &mut PacketReader<'_>, mode: RfTechMode, act_len: usize) -> Result<InterfaceParams> {
    let params = match mode {
        RfTechMode::PollA => InterfaceParams::IsoDepPollA {
            ats: bounded(reader.read_len_prefixed()?, MAX_ATS_LEN, "ATS")?,
        },
        RfTechMode::ListenA => InterfaceParams::IsoDepListenA {
            rats: reader.read_u8()?,
        },
        RfTechMode::PollB => InterfaceParams::IsoDepPollB {
            attrib_res: bounded(reader.read_len_prefixed()?, MAX_ATTRIB_LEN, "ATTRIB response")?,
        },
        RfTechMode::ListenB => {
            let attrib_req = bounded(reader.read_len_prefixed()?, MAX_ATTRIB_LEN, "ATTRIB command")?;
            if attrib_req.len() < NFCID0_LEN {
                return Err(Error::malformed(format!(
                    "ATTRIB command of {} bytes has no NFCID0",
                    attrib_req.len()
                )));
            }
            let mut nfcid0 = [0u8; NFCID0_LEN];
            nfcid0.copy_from_slice(&attrib_req[..NFCID0_LEN]);
            InterfaceParams::IsoDepListenB { attrib_req, nfcid0 }
        }
        _ => InterfaceParams::Unparsed(reader.read_bytes(act_len)?.to_vec()),
    };
    Ok(params)
}

fn decode_nfc_dep(reader: &mut PacketReader<'_>, mode: RfTechMode) -> Result<InterfaceParams> {
    let atr = bounded(reader.read_len_prefixed()?, MAX_ATR_LEN, "ATR")?;
    let params = if mode.is_listen() {
        let general_bytes = atr.get(ATR_REQ_GEN_BYTES_OFFSET..).unwrap_or_default().to_vec();
        InterfaceParams::NfcDepListen { atr_req: atr, general_bytes }
    } else {
        let general_bytes = atr.get(ATR_RES_GEN_BYTES_OFFSET..).unwrap_or_default().to_vec();
        InterfaceParams::NfcDepPoll { atr_res: atr, general_bytes }
    };
    Ok(params)
}

fn bounded(field: &[u8], max: usize, name: &str) -> Result<Vec<u8>> {
    if field.len() > max {
        return Err(Error::malformed(format!("{} length {} exceeds {}", name, field.len(), max)));
    }
    Ok(field.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISO_DEP: u8 = 0x02;
    const FRAME: u8 = 0x01;
    const PROTO_18092_ACTIVE: u8 = 0x05;
    const PROTO_T1T: u8 = 0x01;

    fn header(interface: u8, protocol: u8, mode: u8, act_len: u8) -> Vec<u8> {
        vec![
            0x01, // RF discovery id
            interface, protocol, mode,
            0x02, // max payload size
            0x03, // credits
            0x01, 0x05, // RF params
            0x01, 0x02, 0x03, // data mode, tx, rx
            act_len,
        ]
    }

    #[test]
    fn test_iso_dep_poll_a() {
        let mut packet = header(ISO_DEP, PROTO_18092_ACTIVE, 0x00, 0x04);
        packet.push(0x0A);
        packet.extend(1..=10u8);

        let record = decode(&packet).unwrap();
        assert_eq!(record.rf_disc_id, 0x01);
        assert_eq!(record.interface, RfInterface::IsoDep);
        assert_eq!(record.protocol, RfProtocol::NfcDep);
        assert_eq!(record.rf_tech.mode, RfTechMode::PollA);
        assert_eq!(record.rf_tech.raw, vec![0x05]);
        assert_eq!(record.max_payload_size, 0x02);
        assert_eq!(record.initial_credits, 0x03);
        assert_eq!(record.data_mode, 0x01);
        assert_eq!(record.tx_bitrate, 0x02);
        assert_eq!(record.rx_bitrate, 0x03);
        assert_eq!(
            record.interface_params,
            InterfaceParams::IsoDepPollA { ats: (1..=10u8).collect() }
        );
    }

    #[test]
    fn test_short_header_fails() {
        let packet = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert!(decode(&packet).unwrap_err().is_malformed());
    }

    #[test]
    fn test_iso_dep_listen_a() {
        let mut packet = header(ISO_DEP, PROTO_18092_ACTIVE, 0x80, 0x01);
        packet.push(0x04);
        let record = decode(&packet).unwrap();
        assert_eq!(record.interface_params, InterfaceParams::IsoDepListenA { rats: 0x04 });
    }

    #[test]
    fn test_iso_dep_poll_b() {
        let mut packet = header(ISO_DEP, PROTO_18092_ACTIVE, 0x01, 0x04);
        packet.extend_from_slice(&[0x05, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E]);
        let record = decode(&packet).unwrap();
        assert_eq!(
            record.interface_params,
            InterfaceParams::IsoDepPollB { attrib_res: vec![0x0A, 0x0B, 0x0C, 0x0D, 0x0E] }
        );
    }

    #[test]
    fn test_iso_dep_listen_b() {
        let mut packet = header(ISO_DEP, PROTO_18092_ACTIVE, 0x81, 0x0A);
        packet.push(0x09);
        packet.extend(1..=9u8);
        let record = decode(&packet).unwrap();
        match record.interface_params {
            InterfaceParams::IsoDepListenB { attrib_req, nfcid0 } => {
                assert_eq!(attrib_req.len(), 9);
                assert_eq!(nfcid0, [0x01, 0x02, 0x03, 0x04]);
            }
            other => panic!("unexpected params {:?}", other),
        }
    }

    #[test]
    fn test_t1t_hr_goes_to_rf_tech() {
        let mut packet = header(FRAME, PROTO_T1T, 0x00, 0x02);
        packet.extend_from_slice(&[0x0A, 0x0B]);
        let record = decode(&packet).unwrap();
        assert_eq!(record.rf_tech.hr, vec![0x0A, 0x0B]);
        assert_eq!(record.interface_params, InterfaceParams::Frame);
    }

    #[test]
    fn test_sub_length_past_end_fails() {
        let mut packet = header(ISO_DEP, 0x04, 0x00, 0x05);
        packet.extend_from_slice(&[0x0A, 0x01, 0x02]);
        assert!(decode(&packet).is_err());

        let mut packet = header(FRAME, PROTO_T1T, 0x00, 0x02);
        packet.push(0x0A);
        assert!(decode(&packet).is_err());
    }

    #[test]
    fn test_oversized_ats_fails() {
        let mut packet = header(ISO_DEP, 0x04, 0x00, 62);
        packet.push(61);
        packet.extend(std::iter::repeat(0u8).take(61));
        assert!(decode(&packet).unwrap_err().is_malformed());
    }

    #[test]
    fn test_nfc_dep_poll_general_bytes() {
        let mut atr_res: Vec<u8> = (0..15u8).collect();
        atr_res.extend_from_slice(&[0x46, 0x66, 0x6D]);
        let mut packet = header(0x03, 0x05, 0x00, atr_res.len() as u8 + 1);
        packet.push(atr_res.len() as u8);
        packet.extend_from_slice(&atr_res);

        let record = decode(&packet).unwrap();
        assert_eq!(record.protocol, RfProtocol::NfcDep);
        match record.interface_params {
            InterfaceParams::NfcDepPoll { atr_res: got, general_bytes } => {
                assert_eq!(got, atr_res);
                assert_eq!(general_bytes, vec![0x46, 0x66, 0x6D]);
            }
            other => panic!("unexpected params {:?}", other),
        }
    }

    #[test]
    fn test_nfc_dep_listen_short_atr() {
        let mut packet = header(0x03, 0x05, 0x82, 0x04);
        packet.extend_from_slice(&[0x03, 0xD4, 0x00, 0x01]);
        let record = decode(&packet).unwrap();
        assert_eq!(
            record.interface_params,
            InterfaceParams::NfcDepListen { atr_req: vec![0xD4, 0x00, 0x01], general_bytes: vec![] }
        );
    }

    #[test]
    fn test_unknown_combination_keeps_bytes() {
        let mut packet = header(0x80, 0x80, 0x00, 0x03);
        packet.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let record = decode(&packet).unwrap();
        assert_eq!(record.interface, RfInterface::Mifare);
        assert_eq!(record.interface_params, InterfaceParams::Unparsed(vec![0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn test_no_activation_params() {
        let packet = header(ISO_DEP, 0x04, 0x00, 0x00);
        let record = decode(&packet).unwrap();
        assert_eq!(record.interface_params, InterfaceParams::Empty);
    }
}
