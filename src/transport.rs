//! Collaborators at the controller boundary
//!
//! The transport delivers raw NCI bytes to and from the controller hardware;
//! a vendor extension may intercept packets before the stack sees them.

use crate::core::{Result, Status};

/// Lifecycle events reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    OpenComplete(Status),
    CloseComplete(Status),
    PowerCycleComplete(Status),
    Error,
}

/// Byte channel to the NFC controller.
///
/// All calls are fire-and-forget; completions and inbound bytes come back
/// to the service as separate inputs.
pub trait Transport: Send {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Writes one encoded NCI segment stream
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    fn power_cycle(&mut self) -> Result<()>;

    /// Gives the controller a chance to prepare before RF discovery starts
    fn pre_discover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Vendor specific interception of NCI traffic.
///
/// `process_cmd` and `process_rsp_ntf` return true when the extension fully
/// consumed the packet; the stack then skips its own handling.
pub trait VendorExtension: Send {
    fn process_cmd(&mut self, _packet: &[u8]) -> bool {
        false
    }

    fn process_rsp_ntf(&mut self, _packet: &[u8]) -> bool {
        false
    }

    /// Observes every transport lifecycle event
    fn on_transport_event(&mut self, _event: TransportEvent) {}
}

/// Extension that consumes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVendorExtension;

impl VendorExtension for NoVendorExtension {}
