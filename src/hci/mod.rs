//! Host Controller Interface over NCI
//!
//! This module implements HCP message framing and reassembly, the persisted
//! pipe/gate configuration and the host-control state machine.

pub mod assembler;
pub mod config;
pub mod event;
pub mod message;
pub mod registry;
pub mod state;

pub use self::assembler::{MessageAssembler, ReceiveBuffer};
pub use self::config::{HciTunables, HostControlConfig, PipeState};
pub use self::event::{HciAction, HciEvent, HciListener, HciRequest};
pub use self::message::{HcpMessage, MessageKind};
pub use self::state::{EeDiscoveryStatus, EeInfo, EeManager, EeStatus, HciState, HostControl};

use crate::core::{GateId, HostId, PipeId};

/// Default size of the internal receive buffer
pub const MAX_HCI_EVENT_LEN: usize = 300;
/// Longest application name
pub const MAX_APP_NAME_LEN: usize = 32;
/// Application registry slots
pub const MAX_APP_CB: usize = 8;
/// Dynamic gate slots
pub const MAX_GATE_CB: usize = 8;
/// Dynamic pipe slots
pub const MAX_PIPE_CB: usize = 16;

/// Well known pipes
pub mod pipe {
    use super::PipeId;

    pub const LINK_MANAGEMENT: PipeId = 0x00;
    pub const ADMIN: PipeId = 0x01;
    pub const FIRST_DYNAMIC: PipeId = 0x02;
    pub const LAST_DYNAMIC: PipeId = 0x6F;
}

/// Well known gates
pub mod gate {
    use super::GateId;

    pub const ADMIN: GateId = 0x00;
    pub const LOOP_BACK: GateId = 0x04;
    pub const IDENTITY_MANAGEMENT: GateId = 0x05;
    pub const LINK_MANAGEMENT: GateId = 0x06;
    pub const FIRST_HOST_SPECIFIC_GENERIC: GateId = 0x10;
    pub const LAST_HOST_SPECIFIC_GENERIC: GateId = 0xEF;
    pub const CONNECTIVITY: GateId = 0x41;
    pub const FIRST_PROPRIETARY: GateId = 0xF0;
    pub const LAST_PROPRIETARY: GateId = 0xFF;
}

/// Well known hosts
pub mod host {
    use super::HostId;

    pub const HOST_CONTROLLER: HostId = 0x00;
    pub const DEVICE_HOST: HostId = 0x01;
    pub const UICC: HostId = 0x02;
    pub const ESE: HostId = 0xC0;
}

/// Commands
pub mod cmd {
    pub const ANY_SET_PARAMETER: u8 = 0x01;
    pub const ANY_GET_PARAMETER: u8 = 0x02;
    pub const ANY_OPEN_PIPE: u8 = 0x03;
    pub const ANY_CLOSE_PIPE: u8 = 0x04;
    pub const ADM_CREATE_PIPE: u8 = 0x10;
    pub const ADM_DELETE_PIPE: u8 = 0x11;
    pub const ADM_NOTIFY_PIPE_CREATED: u8 = 0x12;
    pub const ADM_NOTIFY_PIPE_DELETED: u8 = 0x13;
    pub const ADM_CLEAR_ALL_PIPE: u8 = 0x14;
    pub const ADM_NOTIFY_ALL_PIPE_CLEARED: u8 = 0x15;
}

/// Response codes
pub mod rsp {
    pub const ANY_OK: u8 = 0x00;
    pub const ANY_E_NOT_CONNECTED: u8 = 0x01;
    pub const ANY_E_CMD_PAR_UNKNOWN: u8 = 0x02;
    pub const ANY_E_NOK: u8 = 0x03;
    pub const ADM_E_NO_PIPES_AVAILABLE: u8 = 0x04;
    pub const ANY_E_REG_PAR_UNKNOWN: u8 = 0x05;
    pub const ANY_E_PIPE_NOT_OPENED: u8 = 0x06;
    pub const ANY_E_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const ANY_E_TIMEOUT: u8 = 0x09;
}

/// Events
pub mod evt {
    pub const POST_DATA: u8 = 0x02;
    pub const HOT_PLUG: u8 = 0x03;
    pub const CONNECTIVITY: u8 = 0x10;
    pub const TRANSACTION: u8 = 0x12;
    pub const OPERATION_ENDED: u8 = 0x13;
}

/// Registry indexes
pub mod registry_index {
    /// Admin gate
    pub const SESSION_IDENTITY: u8 = 0x01;
    pub const MAX_PIPE: u8 = 0x02;
    pub const WHITELIST: u8 = 0x03;
    pub const HOST_LIST: u8 = 0x04;

    /// Identity management gate
    pub const VERSION_SW: u8 = 0x01;
    pub const HCI_VERSION: u8 = 0x02;
    pub const VERSION_HW: u8 = 0x03;
    pub const VENDOR_NAME: u8 = 0x04;
    pub const MODEL_ID: u8 = 0x05;
    pub const GATES_LIST: u8 = 0x06;
}

/// True for gate ids an application may allocate
pub fn is_valid_dynamic_gate(gate_id: GateId) -> bool {
    gate_id == gate::LOOP_BACK
        || gate_id == gate::IDENTITY_MANAGEMENT
        || gate_id >= gate::FIRST_HOST_SPECIFIC_GENERIC
}

/// True for pipe ids allocated by the host controller
pub fn is_dynamic_pipe(pipe_id: PipeId) -> bool {
    (pipe::FIRST_DYNAMIC..=pipe::LAST_DYNAMIC).contains(&pipe_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_and_pipe_ranges() {
        assert!(is_valid_dynamic_gate(gate::LOOP_BACK));
        assert!(is_valid_dynamic_gate(gate::CONNECTIVITY));
        assert!(is_valid_dynamic_gate(0xFF));
        assert!(!is_valid_dynamic_gate(0x07));
        assert!(!is_valid_dynamic_gate(gate::ADMIN));

        assert!(is_dynamic_pipe(0x02));
        assert!(is_dynamic_pipe(0x6F));
        assert!(!is_dynamic_pipe(pipe::ADMIN));
        assert!(!is_dynamic_pipe(0x70));
    }
}
