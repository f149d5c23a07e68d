use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{MAX_SEGMENT_PAYLOAD, MSG_HDR_SIZE};
use crate::core::Error;

const MT_SHIFT: u8 = 5;
const PBF_MASK: u8 = 0x10;
const GID_MASK: u8 = 0x0F;
const OID_MASK: u8 = 0x3F;

/// Default ceiling for a reassembled packet payload
pub const DEFAULT_MAX_PACKET_LEN: usize = 4096;

/// NCI message type carried in the top bits of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data,
    Command,
    Response,
    Notification,
}

impl MessageType {
    fn from_header(byte: u8) -> Result<Self, Error> {
        match byte >> MT_SHIFT {
            0 => Ok(MessageType::Data),
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Notification),
            other => Err(Error::malformed(format!("message type {}", other))),
        }
    }

    fn bits(&self) -> u8 {
        let mt = match self {
            MessageType::Data => 0,
            MessageType::Command => 1,
            MessageType::Response => 2,
            MessageType::Notification => 3,
        };
        mt << MT_SHIFT
    }
}

/// A complete NCI packet after segment reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NciPacket {
    pub mt: MessageType,
    /// Group id for control packets, connection id for data packets
    pub gid: u8,
    /// Opcode for control packets, zero for data packets
    pub oid: u8,
    pub payload: Bytes,
}

impl NciPacket {
    /// Builds a control packet
    pub fn control(mt: MessageType, gid: u8, oid: u8, payload: impl Into<Bytes>) -> Self {
        NciPacket {
            mt,
            gid: gid & GID_MASK,
            oid: oid & OID_MASK,
            payload: payload.into(),
        }
    }

    /// Builds a data packet on `conn_id`
    pub fn data(conn_id: u8, payload: impl Into<Bytes>) -> Self {
        NciPacket {
            mt: MessageType::Data,
            gid: conn_id & GID_MASK,
            oid: 0,
            payload: payload.into(),
        }
    }

    /// Connection id of a data packet
    pub fn conn_id(&self) -> u8 {
        self.gid
    }

    fn header(&self, pbf: bool, len: usize) -> [u8; MSG_HDR_SIZE] {
        let mut first = self.mt.bits() | self.gid;
        if pbf {
            first |= PBF_MASK;
        }
        [first, self.oid, len as u8]
    }

    /// Header and payload as one buffer, length field saturated at one segment
    pub fn to_raw(&self) -> Vec<u8> {
        let len = self.payload.len().min(MAX_SEGMENT_PAYLOAD);
        let mut raw = Vec::with_capacity(MSG_HDR_SIZE + self.payload.len());
        raw.extend_from_slice(&self.header(false, len));
        raw.extend_from_slice(&self.payload);
        raw
    }
}

/// Segmenting codec for NCI packets.
///
/// Segments with the packet boundary flag set are held until the final
/// segment arrives and are emitted as one `NciPacket`.
#[derive(Debug, Clone)]
pub struct NciCodec {
    max_packet_len: usize,
    max_segment_len: usize,
    partial: Option<(u8, u8, BytesMut)>,
}

impl Default for NciCodec {
    fn default() -> Self {
        NciCodec::new()
    }
}

impl NciCodec {
    /// Creates a new codec with default limits
    pub fn new() -> Self {
        NciCodec {
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            max_segment_len: MAX_SEGMENT_PAYLOAD,
            partial: None,
        }
    }

    /// Sets the largest segment payload the encoder produces
    pub fn with_max_segment_len(mut self, len: usize) -> Self {
        self.max_segment_len = len.clamp(1, MAX_SEGMENT_PAYLOAD);
        self
    }

    /// Sets the largest reassembled payload the decoder accepts
    pub fn with_max_packet_len(mut self, len: usize) -> Self {
        self.max_packet_len = len;
        self
    }

    /// Drops any partially reassembled packet
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Decodes the next packet, logging and skipping segments that fail to
    /// decode. Errors consume their segment, so decoding resumes at the next
    /// header.
    pub fn decode_skipping(&mut self, src: &mut BytesMut) -> Option<NciPacket> {
        loop {
            match self.decode(src) {
                Ok(packet) => return packet,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable NCI input");
                    self.reset();
                }
            }
        }
    }
}

impl Decoder for NciCodec {
    type Item = NciPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < MSG_HDR_SIZE {
                return Ok(None);
            }
            let len = src[2] as usize;
            if src.len() < MSG_HDR_SIZE + len {
                src.reserve(MSG_HDR_SIZE + len - src.len());
                return Ok(None);
            }

            let first = src[0];
            let oid = src[1] & OID_MASK;
            src.advance(MSG_HDR_SIZE);
            let segment = src.split_to(len);
            let key = first & !PBF_MASK;

            let mut buf = match self.partial.take() {
                Some((k, o, buf)) if k == key && o == oid => buf,
                Some(_) => {
                    return Err(Error::protocol("segment does not continue the pending packet"));
                }
                None => BytesMut::new(),
            };
            if buf.len() + segment.len() > self.max_packet_len {
                return Err(Error::malformed(format!(
                    "packet exceeds {} bytes",
                    self.max_packet_len
                )));
            }
            buf.extend_from_slice(&segment);

            if first & PBF_MASK != 0 {
                self.partial = Some((key, oid, buf));
                continue;
            }

            let mt = MessageType::from_header(first)?;
            let oid = if mt == MessageType::Data { 0 } else { oid };
            return Ok(Some(NciPacket {
                mt,
                gid: first & GID_MASK,
                oid,
                payload: buf.freeze(),
            }));
        }
    }
}

impl Encoder<NciPacket> for NciCodec {
    type Error = Error;

    fn encode(&mut self, item: NciPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.is_empty() {
            dst.put_slice(&item.header(false, 0));
            return Ok(());
        }

        let mut chunks = item.payload.chunks(self.max_segment_len).peekable();
        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            dst.reserve(MSG_HDR_SIZE + chunk.len());
            dst.put_slice(&item.header(more, chunk.len()));
            dst.put_slice(chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_notification() {
        let mut codec = NciCodec::new();
        let mut bytes = BytesMut::from(&[0x61, 0x05, 0x02, 0xAA, 0xBB][..]);
        let packet = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(packet.mt, MessageType::Notification);
        assert_eq!(packet.gid, 0x01);
        assert_eq!(packet.oid, 0x05);
        assert_eq!(&packet.payload[..], &[0xAA, 0xBB]);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_decode_waits_for_full_packet() {
        let mut codec = NciCodec::new();
        let mut bytes = BytesMut::from(&[0x61, 0x05][..]);
        assert!(codec.decode(&mut bytes).unwrap().is_none());
        bytes.extend_from_slice(&[0x02, 0xAA]);
        assert!(codec.decode(&mut bytes).unwrap().is_none());
        bytes.extend_from_slice(&[0xBB]);
        assert!(codec.decode(&mut bytes).unwrap().is_some());
    }

    #[test]
    fn test_segments_are_reassembled() {
        let mut codec = NciCodec::new();
        let mut bytes = BytesMut::from(
            &[0x11, 0x00, 0x02, 0x01, 0x02, 0x01, 0x00, 0x01, 0x03][..],
        );
        let packet = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(packet.mt, MessageType::Data);
        assert_eq!(packet.conn_id(), 0x01);
        assert_eq!(&packet.payload[..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_decode_skipping_resumes_after_bad_segment() {
        let mut codec = NciCodec::new();
        let mut bytes = BytesMut::from(&[0xE1, 0x05, 0x00, 0x01, 0x00, 0x01, 0x81][..]);
        let packet = codec.decode_skipping(&mut bytes).unwrap();
        assert_eq!(packet, NciPacket::data(0x01, vec![0x81]));
        assert!(codec.decode_skipping(&mut bytes).is_none());
    }

    #[test]
    fn test_decode_skipping_drops_broken_reassembly() {
        let mut codec = NciCodec::new();
        // Data segment pending, then a notification segment that cannot continue it
        let mut bytes = BytesMut::from(&[0x11, 0x00, 0x01, 0xAA, 0x61, 0x05, 0x01, 0xBB, 0x01, 0x00, 0x01, 0xCC][..]);
        let packet = codec.decode_skipping(&mut bytes).unwrap();
        assert_eq!(packet, NciPacket::data(0x01, vec![0xCC]));
        assert!(codec.partial.is_none());
    }

    #[test]
    fn test_interleaved_segment_is_rejected() {
        let mut codec = NciCodec::new();
        let mut bytes = BytesMut::from(&[0x11, 0x00, 0x01, 0x01, 0x61, 0x05, 0x00][..]);
        assert!(codec.decode(&mut bytes).is_err());
    }

    #[test]
    fn test_oversized_packet_is_rejected() {
        let mut codec = NciCodec::new().with_max_packet_len(3);
        let mut bytes = BytesMut::from(&[0x10, 0x00, 0x02, 0x01, 0x02, 0x00, 0x00, 0x02, 0x03, 0x04][..]);
        assert!(codec.decode(&mut bytes).unwrap_err().is_malformed());
    }

    #[test]
    fn test_encode_segments_payload() {
        let mut codec = NciCodec::new().with_max_segment_len(2);
        let mut bytes = BytesMut::new();
        codec
            .encode(NciPacket::data(0x01, vec![0x0A, 0x0B, 0x0C]), &mut bytes)
            .unwrap();
        assert_eq!(&bytes[..], &[0x11, 0x00, 0x02, 0x0A, 0x0B, 0x01, 0x00, 0x01, 0x0C]);

        let mut codec = NciCodec::new();
        let packet = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(&packet.payload[..], &[0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn test_encode_empty_command() {
        let mut codec = NciCodec::new();
        let mut bytes = BytesMut::new();
        codec
            .encode(NciPacket::control(MessageType::Command, 0x00, 0x01, Bytes::new()), &mut bytes)
            .unwrap();
        assert_eq!(&bytes[..], &[0x20, 0x01, 0x00]);
    }

    #[test]
    fn test_to_raw() {
        let packet = NciPacket::control(MessageType::Notification, 0x01, 0x03, vec![0x01, 0x02]);
        assert_eq!(packet.to_raw(), vec![0x61, 0x03, 0x02, 0x01, 0x02]);
    }
}
