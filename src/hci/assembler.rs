//! Reassembly of chained HCP packets into one message

use bytes::{Bytes, BytesMut};

use super::message::MessageKind;
use super::{is_dynamic_pipe, MAX_HCI_EVENT_LEN};
use crate::core::PipeId;

/// Where the message being assembled is collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveBuffer {
    /// The fixed internal buffer
    Internal { capacity: usize },
    /// The response buffer an application registered with its last event
    Response { capacity: usize },
}

impl ReceiveBuffer {
    pub fn capacity(&self) -> usize {
        match *self {
            ReceiveBuffer::Internal { capacity } | ReceiveBuffer::Response { capacity } => capacity,
        }
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        ReceiveBuffer::Internal {
            capacity: MAX_HCI_EVENT_LEN,
        }
    }
}

/// Picks the buffer for a message starting on `pipe`.
///
/// Only an event on a dynamic pipe goes to the application's response
/// buffer, and only while one of non-zero size is registered.
pub fn select_receive_buffer(
    pipe: PipeId,
    kind: MessageKind,
    rsp_buf_size: usize,
    internal_capacity: usize,
) -> ReceiveBuffer {
    if is_dynamic_pipe(pipe) && kind == MessageKind::Event && rsp_buf_size > 0 {
        ReceiveBuffer::Response {
            capacity: rsp_buf_size,
        }
    } else {
        ReceiveBuffer::Internal {
            capacity: internal_capacity,
        }
    }
}

/// Collects packet payloads of one HCP message.
///
/// Overflow keeps what fits and raises a failure flag that stays set until
/// the next `begin`.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    target: ReceiveBuffer,
    data: BytesMut,
    failed: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new message in `target`
    pub fn begin(&mut self, target: ReceiveBuffer) {
        self.target = target;
        self.data.clear();
        self.data.reserve(target.capacity());
        self.failed = false;
    }

    /// Appends one packet payload
    pub fn assemble(&mut self, fragment: &[u8]) {
        if fragment.is_empty() {
            return;
        }
        let room = self.target.capacity().saturating_sub(self.data.len());
        if fragment.len() > room {
            self.data.extend_from_slice(&fragment[..room]);
            self.failed = true;
        } else {
            self.data.extend_from_slice(fragment);
        }
    }

    pub fn target(&self) -> ReceiveBuffer {
        self.target
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn assembly_failed(&self) -> bool {
        self.failed
    }

    /// Hands out the assembled bytes, leaving the assembler empty
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(capacity: usize) -> MessageAssembler {
        let mut assembler = MessageAssembler::new();
        assembler.begin(ReceiveBuffer::Internal { capacity });
        assembler
    }

    #[test]
    fn test_assemble_within_capacity() {
        let mut asm = assembler(10);
        asm.assemble(&[0x01, 0x02]);
        asm.assemble(&[0x03]);
        assert_eq!(asm.len(), 3);
        assert_eq!(asm.data(), &[0x01, 0x02, 0x03]);
        assert!(!asm.assembly_failed());
    }

    #[test]
    fn test_overflow_keeps_what_fits() {
        let mut asm = assembler(10);
        asm.assemble(&[0u8; 9]);
        asm.assemble(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(asm.len(), 10);
        assert_eq!(asm.data()[9], 0xAA);
        assert!(asm.assembly_failed());

        // Sticky even though nothing more is lost
        asm.assemble(&[]);
        assert!(asm.assembly_failed());
        assert_eq!(asm.len(), 10);
    }

    #[test]
    fn test_failure_flag_survives_fitting_append() {
        let mut asm = assembler(3);
        asm.assemble(&[1, 2, 3, 4]);
        assert!(asm.assembly_failed());
        let _ = asm.take();
        asm.assemble(&[5]);
        assert!(asm.assembly_failed());

        asm.begin(ReceiveBuffer::default());
        assert!(!asm.assembly_failed());
        assert!(asm.is_empty());
    }

    #[test]
    fn test_zero_length_is_noop() {
        let mut asm = assembler(4);
        asm.assemble(&[]);
        assert_eq!(asm.len(), 0);
        assert!(!asm.assembly_failed());
    }

    #[test]
    fn test_receive_buffer_selection() {
        let internal = ReceiveBuffer::Internal { capacity: MAX_HCI_EVENT_LEN };

        assert_eq!(select_receive_buffer(0x01, MessageKind::Event, 64, MAX_HCI_EVENT_LEN), internal);
        assert_eq!(select_receive_buffer(0x10, MessageKind::Response, 64, MAX_HCI_EVENT_LEN), internal);
        assert_eq!(select_receive_buffer(0x10, MessageKind::Event, 0, MAX_HCI_EVENT_LEN), internal);
        assert_eq!(
            select_receive_buffer(0x10, MessageKind::Event, 10, MAX_HCI_EVENT_LEN),
            ReceiveBuffer::Response { capacity: 10 }
        );
    }
}
