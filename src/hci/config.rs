//! HCI configuration
//!
//! `HostControlConfig` is the persisted pipe and gate state; it is validated
//! as a whole when loaded and replaced by the default on any inconsistency.
//! `HciTunables` holds the timeouts and limits read at startup.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{gate, host, is_valid_dynamic_gate, pipe, MAX_APP_CB, MAX_APP_NAME_LEN, MAX_GATE_CB, MAX_HCI_EVENT_LEN, MAX_PIPE_CB};
use crate::core::{AppHandle, Error, GateId, HostId, PipeId, Result, SessionId};

/// Lifecycle of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeState {
    Closed,
    Opened,
    Opening,
}

impl PipeState {
    pub fn code(&self) -> u8 {
        match self {
            PipeState::Closed => 0x00,
            PipeState::Opened => 0x01,
            PipeState::Opening => 0x02,
        }
    }
}

impl TryFrom<u8> for PipeState {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x00 => Ok(PipeState::Closed),
            0x01 => Ok(PipeState::Opened),
            0x02 => Ok(PipeState::Opening),
            other => Err(Error::config(format!("pipe state {:#04x}", other))),
        }
    }
}

/// A dynamically allocated gate; `gate_id == 0` marks a free slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEntry {
    pub gate_id: GateId,
    /// Raw `AppHandle` of the owning application
    pub gate_owner: u16,
    /// Bit n set when pipe slot n is bound to this gate
    pub pipe_inx_mask: u32,
}

/// A dynamic pipe; `pipe_id == 0` marks a free slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeEntry {
    pub pipe_id: PipeId,
    /// Raw `PipeState` code, kept raw so corrupt values can be detected
    pub pipe_state: u8,
    pub local_gate: GateId,
    pub dest_host: HostId,
    pub dest_gate: GateId,
}

impl PipeEntry {
    pub fn state(&self) -> Option<PipeState> {
        PipeState::try_from(self.pipe_state).ok()
    }
}

/// Persisted HCI network state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostControlConfig {
    pub session_id: SessionId,
    pub reg_app_names: [String; MAX_APP_CB],
    pub send_conn_evts: [bool; MAX_APP_CB],
    pub dyn_gates: [GateEntry; MAX_GATE_CB],
    pub dyn_pipes: [PipeEntry; MAX_PIPE_CB],
    /// State of the admin pipe (0x01)
    pub admin_pipe_state: u8,
    /// State of the link management pipe (0x00)
    pub link_mgmt_pipe_state: u8,
    /// Pipe slots bound to the identity management gate
    pub id_mgmt_pipe_mask: u32,
}

impl Default for HostControlConfig {
    fn default() -> Self {
        HostControlConfig {
            session_id: SessionId::UNSET,
            reg_app_names: Default::default(),
            send_conn_evts: [false; MAX_APP_CB],
            dyn_gates: [GateEntry::default(); MAX_GATE_CB],
            dyn_pipes: [PipeEntry::default(); MAX_PIPE_CB],
            admin_pipe_state: PipeState::Closed.code(),
            link_mgmt_pipe_state: PipeState::Closed.code(),
            id_mgmt_pipe_mask: 0,
        }
    }
}

impl HostControlConfig {
    /// Serializes the configuration for persistent storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses and validates a persisted configuration
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: HostControlConfig = bincode::deserialize(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads persisted bytes, falling back to the default on any problem.
    ///
    /// The flag is true when the stored data was absent or discarded.
    pub fn load_or_default(bytes: Option<&[u8]>) -> (Self, bool) {
        match bytes.map(Self::from_bytes) {
            Some(Ok(config)) => (config, false),
            Some(Err(e)) => {
                warn!(error = %e, "discarding persisted HCI configuration");
                (Self::default(), true)
            }
            None => (Self::default(), true),
        }
    }

    /// Checks the configuration for internal consistency
    pub fn validate(&self) -> Result<()> {
        self.validate_apps()?;
        let gate_ids = self.validate_gates()?;
        self.validate_pipes(&gate_ids)?;

        for (name, code) in [("admin", self.admin_pipe_state), ("link management", self.link_mgmt_pipe_state)] {
            if PipeState::try_from(code).is_err() {
                return Err(Error::config(format!("{} pipe state {:#04x}", name, code)));
            }
        }

        for slot in mask_slots(self.id_mgmt_pipe_mask) {
            let entry = self
                .dyn_pipes
                .get(slot)
                .ok_or_else(|| Error::config(format!("identity management pipe slot {}", slot)))?;
            if entry.pipe_id < pipe::FIRST_DYNAMIC || entry.local_gate != gate::IDENTITY_MANAGEMENT {
                return Err(Error::config(format!(
                    "identity management pipe slot {} holds pipe {:#04x} on gate {:#04x}",
                    slot, entry.pipe_id, entry.local_gate
                )));
            }
        }
        Ok(())
    }

    fn validate_apps(&self) -> Result<()> {
        let mut names = HashSet::new();
        for name in &self.reg_app_names {
            if name.len() > MAX_APP_NAME_LEN {
                return Err(Error::config(format!("application name of {} bytes", name.len())));
            }
            if !name.is_empty() && !names.insert(name.as_str()) {
                return Err(Error::config(format!("duplicate application name {:?}", name)));
            }
        }
        Ok(())
    }

    fn validate_gates(&self) -> Result<HashSet<GateId>> {
        let mut gate_ids = HashSet::new();
        let mut claimed: u32 = 0;
        for entry in self.dyn_gates.iter().filter(|g| g.gate_id != 0) {
            if !is_valid_dynamic_gate(entry.gate_id) {
                return Err(Error::config(format!("gate id {:#04x}", entry.gate_id)));
            }
            if !gate_ids.insert(entry.gate_id) {
                return Err(Error::config(format!("duplicate gate id {:#04x}", entry.gate_id)));
            }

            let owner = AppHandle(entry.gate_owner)
                .index()
                .filter(|&i| i < MAX_APP_CB)
                .ok_or_else(|| Error::config(format!("gate owner {:#06x}", entry.gate_owner)))?;
            if entry.gate_id != gate::CONNECTIVITY && self.reg_app_names[owner].is_empty() {
                return Err(Error::config(format!(
                    "gate {:#04x} owned by unregistered application {}",
                    entry.gate_id, owner
                )));
            }

            if claimed & entry.pipe_inx_mask != 0 {
                return Err(Error::config(format!("gate {:#04x} shares a pipe slot", entry.gate_id)));
            }
            claimed |= entry.pipe_inx_mask;

            for slot in mask_slots(entry.pipe_inx_mask) {
                match self.dyn_pipes.get(slot) {
                    Some(p) if p.pipe_id >= pipe::FIRST_DYNAMIC => {}
                    _ => {
                        return Err(Error::config(format!(
                            "gate {:#04x} names unconfigured pipe slot {}",
                            entry.gate_id, slot
                        )))
                    }
                }
            }
        }
        Ok(gate_ids)
    }

    fn validate_pipes(&self, gate_ids: &HashSet<GateId>) -> Result<()> {
        let mut pipe_ids = HashSet::new();
        for entry in self.dyn_pipes.iter().filter(|p| p.pipe_id != 0) {
            if entry.pipe_id < pipe::FIRST_DYNAMIC || entry.pipe_id > pipe::LAST_DYNAMIC {
                return Err(Error::config(format!("pipe id {:#04x}", entry.pipe_id)));
            }
            if entry.state().is_none() {
                return Err(Error::config(format!(
                    "pipe {:#04x} state {:#04x}",
                    entry.pipe_id, entry.pipe_state
                )));
            }
            if !is_valid_dynamic_gate(entry.local_gate) || !is_valid_dynamic_gate(entry.dest_gate) {
                return Err(Error::config(format!("pipe {:#04x} gates", entry.pipe_id)));
            }
            if !pipe_ids.insert(entry.pipe_id) {
                return Err(Error::config(format!("duplicate pipe id {:#04x}", entry.pipe_id)));
            }
            let local_known = gate_ids.contains(&entry.local_gate)
                || entry.local_gate == gate::IDENTITY_MANAGEMENT
                || entry.local_gate == gate::LOOP_BACK;
            if !local_known {
                return Err(Error::config(format!(
                    "pipe {:#04x} on unconfigured gate {:#04x}",
                    entry.pipe_id, entry.local_gate
                )));
            }
        }
        Ok(())
    }
}

/// Slot indexes set in a pipe mask
pub(crate) fn mask_slots(mask: u32) -> impl Iterator<Item = usize> {
    (0..32usize).filter(move |i| mask & (1 << i) != 0)
}

/// Tunables read once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HciTunables {
    /// Wait for a response to an HCP command
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub response_timeout: Duration,
    /// Wait for the other hosts to finish network initialisation
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub network_enable_timeout: Duration,
    /// Capacity of the internal receive buffer
    pub max_message_len: usize,
    /// Largest outbound HCP packet, headers included
    pub max_fragment_len: usize,
    /// Hosts allowed to create pipes to our gates
    pub allowed_hosts: Vec<HostId>,
    /// Open the admin pipe straight away for loop-back testing
    pub loopback_debug: bool,
}

impl Default for HciTunables {
    fn default() -> Self {
        HciTunables {
            response_timeout: Duration::from_millis(2000),
            network_enable_timeout: Duration::from_millis(4000),
            max_message_len: MAX_HCI_EVENT_LEN,
            max_fragment_len: 32,
            allowed_hosts: vec![host::UICC, 0x03, host::ESE],
            loopback_debug: false,
        }
    }
}

impl HciTunables {
    pub fn is_host_allowed(&self, host: HostId) -> bool {
        self.allowed_hosts.contains(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> HostControlConfig {
        let mut config = HostControlConfig::default();
        config.reg_app_names[0] = "wallet".to_string();
        config.reg_app_names[1] = "transit".to_string();
        config.dyn_gates[0] = GateEntry {
            gate_id: 0x10,
            gate_owner: AppHandle::from_index(0).0,
            pipe_inx_mask: 0b01,
        };
        config.dyn_gates[1] = GateEntry {
            gate_id: gate::CONNECTIVITY,
            gate_owner: AppHandle::from_index(5).0,
            pipe_inx_mask: 0b10,
        };
        config.dyn_pipes[0] = PipeEntry {
            pipe_id: 0x20,
            pipe_state: PipeState::Opened.code(),
            local_gate: 0x10,
            dest_host: host::UICC,
            dest_gate: 0x10,
        };
        config.dyn_pipes[1] = PipeEntry {
            pipe_id: 0x21,
            pipe_state: PipeState::Closed.code(),
            local_gate: gate::CONNECTIVITY,
            dest_host: host::UICC,
            dest_gate: gate::CONNECTIVITY,
        };
        config
    }

    #[test]
    fn test_valid_config_accepted() {
        assert!(HostControlConfig::default().validate().is_ok());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_duplicate_app_name_rejected() {
        let mut config = valid_config();
        config.reg_app_names[1] = "wallet".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_long_app_name_rejected() {
        let mut config = valid_config();
        config.reg_app_names[2] = "x".repeat(MAX_APP_NAME_LEN + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_gate_rejected() {
        let mut config = valid_config();
        config.dyn_gates[2] = GateEntry {
            gate_id: 0x10,
            gate_owner: AppHandle::from_index(1).0,
            pipe_inx_mask: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gate_owned_by_unregistered_app_rejected() {
        let mut config = valid_config();
        config.dyn_gates[0].gate_owner = AppHandle::from_index(4).0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_pipe_slot_rejected() {
        let mut config = valid_config();
        config.dyn_gates[1].pipe_inx_mask = 0b11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_pipe_rejected() {
        let mut config = valid_config();
        config.dyn_pipes[1].pipe_id = 0x20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_pipe_state_rejected() {
        let mut config = valid_config();
        config.dyn_pipes[0].pipe_state = 0x07;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.admin_pipe_state = 0x09;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pipe_on_unknown_gate_rejected() {
        let mut config = valid_config();
        config.dyn_pipes[2] = PipeEntry {
            pipe_id: 0x22,
            pipe_state: 0,
            local_gate: 0x30,
            dest_host: host::UICC,
            dest_gate: 0x30,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_mask_must_name_identity_pipes() {
        let mut config = valid_config();
        config.id_mgmt_pipe_mask = 0b100;
        assert!(config.validate().is_err());

        config.dyn_pipes[2] = PipeEntry {
            pipe_id: 0x22,
            pipe_state: 0,
            local_gate: gate::IDENTITY_MANAGEMENT,
            dest_host: host::UICC,
            dest_gate: gate::IDENTITY_MANAGEMENT,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_persisted_round_trip_and_corruption() {
        let config = valid_config();
        let bytes = config.to_bytes().unwrap();
        assert_eq!(HostControlConfig::from_bytes(&bytes).unwrap(), config);

        let (loaded, reset) = HostControlConfig::load_or_default(Some(&bytes[..bytes.len() / 2]));
        assert!(reset);
        assert_eq!(loaded, HostControlConfig::default());

        let (_, reset) = HostControlConfig::load_or_default(None);
        assert!(reset);
    }

    #[test]
    fn test_invalid_persisted_config_is_discarded() {
        let mut config = valid_config();
        config.reg_app_names[1] = "wallet".to_string();
        let bytes = config.to_bytes().unwrap();
        let (loaded, reset) = HostControlConfig::load_or_default(Some(&bytes));
        assert!(reset);
        assert_eq!(loaded, HostControlConfig::default());
    }

    #[test]
    fn test_tunables_from_json() {
        let tunables: HciTunables =
            serde_json::from_str(r#"{"response_timeout": 500, "allowed_hosts": [2]}"#).unwrap();
        assert_eq!(tunables.response_timeout, Duration::from_millis(500));
        assert_eq!(tunables.network_enable_timeout, Duration::from_millis(4000));
        assert!(tunables.is_host_allowed(host::UICC));
        assert!(!tunables.is_host_allowed(host::ESE));
        assert_eq!(tunables.max_message_len, MAX_HCI_EVENT_LEN);
    }
}
