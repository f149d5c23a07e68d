//! HCP packet and message framing
//!
//! Every HCP packet starts with a header byte holding the chaining bit and
//! the pipe id. The first packet of a message also carries the message
//! header: two type bits and a six bit instruction.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::{Error, PipeId, Result};

/// Set on the last packet of a message
pub const CHAINING_BIT: u8 = 0x80;
const PIPE_MASK: u8 = 0x7F;
const TYPE_SHIFT: u8 = 6;
const INSTRUCTION_MASK: u8 = 0x3F;

/// Smallest fragment able to carry both headers and one data byte
pub const MIN_FRAGMENT_LEN: usize = 3;

/// HCP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
    Response,
}

impl MessageKind {
    fn bits(&self) -> u8 {
        match self {
            MessageKind::Command => 0,
            MessageKind::Event => 1,
            MessageKind::Response => 2,
        }
    }
}

/// Splits a packet header byte into (last fragment, pipe)
pub fn parse_packet_header(byte: u8) -> (bool, PipeId) {
    (byte & CHAINING_BIT != 0, byte & PIPE_MASK)
}

/// Splits a message header byte into (type, instruction)
pub fn parse_message_header(byte: u8) -> Result<(MessageKind, u8)> {
    let kind = match byte >> TYPE_SHIFT {
        0 => MessageKind::Command,
        1 => MessageKind::Event,
        2 => MessageKind::Response,
        _ => return Err(Error::malformed(format!("HCP message type in {:#04x}", byte))),
    };
    Ok((kind, byte & INSTRUCTION_MASK))
}

/// A complete outbound HCP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcpMessage {
    pub pipe: PipeId,
    pub kind: MessageKind,
    /// Command, event or response code
    pub instruction: u8,
    pub data: Vec<u8>,
}

impl HcpMessage {
    pub fn command(pipe: PipeId, instruction: u8, data: impl Into<Vec<u8>>) -> Self {
        HcpMessage {
            pipe,
            kind: MessageKind::Command,
            instruction,
            data: data.into(),
        }
    }

    pub fn event(pipe: PipeId, instruction: u8, data: impl Into<Vec<u8>>) -> Self {
        HcpMessage {
            pipe,
            kind: MessageKind::Event,
            instruction,
            data: data.into(),
        }
    }

    pub fn response(pipe: PipeId, code: u8, data: impl Into<Vec<u8>>) -> Self {
        HcpMessage {
            pipe,
            kind: MessageKind::Response,
            instruction: code,
            data: data.into(),
        }
    }

    /// Splits the message into HCP packets of at most `max_fragment_len` bytes
    pub fn fragments(&self, max_fragment_len: usize) -> Vec<Bytes> {
        let max = max_fragment_len.max(MIN_FRAGMENT_LEN);
        let pipe = self.pipe & PIPE_MASK;
        let message_header = (self.kind.bits() << TYPE_SHIFT) | (self.instruction & INSTRUCTION_MASK);

        let first_len = self.data.len().min(max - 2);
        let (head, mut rest) = self.data.split_at(first_len);

        let mut out = Vec::new();
        let mut first = BytesMut::with_capacity(2 + head.len());
        first.put_u8(if rest.is_empty() { pipe | CHAINING_BIT } else { pipe });
        first.put_u8(message_header);
        first.put_slice(head);
        out.push(first.freeze());

        while !rest.is_empty() {
            let take = rest.len().min(max - 1);
            let (chunk, tail) = rest.split_at(take);
            rest = tail;
            let mut frag = BytesMut::with_capacity(1 + chunk.len());
            frag.put_u8(if rest.is_empty() { pipe | CHAINING_BIT } else { pipe });
            frag.put_slice(chunk);
            out.push(frag.freeze());
        }
        out
    }
}
