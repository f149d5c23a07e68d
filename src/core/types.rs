use serde::{Deserialize, Serialize};

/// Identifier of an HCI pipe (0x00..=0x7F)
pub type PipeId = u8;

/// Identifier of an HCI gate
pub type GateId = u8;

/// Identifier of an HCI host
pub type HostId = u8;

/// Identifier of an NFC execution environment
pub type NfceeId = u8;

/// Outcome reported to listeners for decodes and state machine procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Rejected,
    Failed,
    Timeout,
    BufferFull,
}

impl Status {
    /// Returns true for `Status::Ok`
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Handle of an application registered with the host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppHandle(pub u16);

impl AppHandle {
    /// Handle group shared by every HCI application
    pub const GROUP: u16 = 0x0400;
    const INDEX_MASK: u16 = 0x00FF;

    /// Builds the handle of the application in registry slot `index`
    pub fn from_index(index: usize) -> Self {
        AppHandle(Self::GROUP | (index as u16 & Self::INDEX_MASK))
    }

    /// Returns the registry slot of this handle, if it belongs to the HCI group
    pub fn index(&self) -> Option<usize> {
        if self.0 & !Self::INDEX_MASK == Self::GROUP {
            Some((self.0 & Self::INDEX_MASK) as usize)
        } else {
            None
        }
    }
}

/// HCI session identity held in the admin gate registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 8]);

impl SessionId {
    /// Identity used before any session has been negotiated
    pub const UNSET: SessionId = SessionId([0xFF; 8]);

    /// Generates a new random session identity
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 8];
        rng.fill(&mut bytes);
        SessionId(bytes)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        SessionId::UNSET
    }
}

/// Power mode requested by the device manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Full,
    Low,
}
