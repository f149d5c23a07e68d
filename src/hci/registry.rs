//! Pipe, gate and application tables
//!
//! Lookups and mutations of the tables held in `HostControlConfig`. Pipe
//! slots are bound to a gate through that gate's pipe index mask.

use super::config::{mask_slots, GateEntry, HostControlConfig, PipeEntry, PipeState};
use super::{gate, is_dynamic_pipe, is_valid_dynamic_gate, MAX_APP_NAME_LEN};
use crate::core::{AppHandle, Error, GateId, HostId, PipeId, Result};

impl HostControlConfig {
    pub fn find_pipe(&self, pipe_id: PipeId) -> Option<&PipeEntry> {
        if pipe_id == 0 {
            return None;
        }
        self.dyn_pipes.iter().find(|p| p.pipe_id == pipe_id)
    }

    fn pipe_slot(&self, pipe_id: PipeId) -> Option<usize> {
        if pipe_id == 0 {
            return None;
        }
        self.dyn_pipes.iter().position(|p| p.pipe_id == pipe_id)
    }

    pub fn find_gate(&self, gate_id: GateId) -> Option<&GateEntry> {
        if gate_id == 0 {
            return None;
        }
        self.dyn_gates.iter().find(|g| g.gate_id == gate_id)
    }

    /// Application owning the gate the pipe is bound to
    pub fn pipe_owner(&self, pipe_id: PipeId) -> Option<AppHandle> {
        let pipe = self.find_pipe(pipe_id)?;
        self.find_gate(pipe.local_gate).map(|g| AppHandle(g.gate_owner))
    }

    /// Changes a pipe's state; false if the pipe is unknown
    pub fn set_pipe_state(&mut self, pipe_id: PipeId, state: PipeState) -> bool {
        match self.pipe_slot(pipe_id) {
            Some(slot) => {
                self.dyn_pipes[slot].pipe_state = state.code();
                true
            }
            None => false,
        }
    }

    /// Records a pipe created by the host controller, closed and bound to
    /// its local gate
    pub fn alloc_pipe(
        &mut self,
        pipe_id: PipeId,
        local_gate: GateId,
        dest_host: HostId,
        dest_gate: GateId,
    ) -> Result<()> {
        if !is_dynamic_pipe(pipe_id) {
            return Err(Error::protocol(format!("pipe id {:#04x} is not dynamic", pipe_id)));
        }
        if self.find_pipe(pipe_id).is_some() {
            return Err(Error::protocol(format!("pipe {:#04x} already exists", pipe_id)));
        }
        let gate_slot = self.dyn_gates.iter().position(|g| g.gate_id == local_gate && local_gate != 0);
        if gate_slot.is_none() && local_gate != gate::IDENTITY_MANAGEMENT && local_gate != gate::LOOP_BACK {
            return Err(Error::protocol(format!("no local gate {:#04x}", local_gate)));
        }
        let slot = self
            .dyn_pipes
            .iter()
            .position(|p| p.pipe_id == 0)
            .ok_or_else(|| Error::protocol("no free pipe slot"))?;

        self.dyn_pipes[slot] = PipeEntry {
            pipe_id,
            pipe_state: PipeState::Closed.code(),
            local_gate,
            dest_host,
            dest_gate,
        };
        match gate_slot {
            Some(g) => self.dyn_gates[g].pipe_inx_mask |= 1 << slot,
            None if local_gate == gate::IDENTITY_MANAGEMENT => self.id_mgmt_pipe_mask |= 1 << slot,
            None => {}
        }
        Ok(())
    }

    /// Forgets a pipe and unbinds it from its gate
    pub fn release_pipe(&mut self, pipe_id: PipeId) -> Option<PipeEntry> {
        let slot = self.pipe_slot(pipe_id)?;
        let entry = std::mem::take(&mut self.dyn_pipes[slot]);
        let bit = !(1u32 << slot);
        for gate in self.dyn_gates.iter_mut() {
            gate.pipe_inx_mask &= bit;
        }
        self.id_mgmt_pipe_mask &= bit;
        Some(entry)
    }

    /// Releases every pipe leading to `host`, or every pipe when `None`
    pub fn remove_all_pipes_from_host(&mut self, host: Option<HostId>) -> Vec<PipeEntry> {
        let doomed: Vec<PipeId> = self
            .dyn_pipes
            .iter()
            .filter(|p| p.pipe_id != 0 && host.map_or(true, |h| p.dest_host == h))
            .map(|p| p.pipe_id)
            .collect();
        doomed.into_iter().filter_map(|id| self.release_pipe(id)).collect()
    }

    /// Pipes bound to a gate, in slot order
    pub fn pipes_of_gate(&self, gate_id: GateId) -> Vec<PipeId> {
        let mask = if gate_id == gate::IDENTITY_MANAGEMENT {
            self.id_mgmt_pipe_mask
        } else {
            match self.find_gate(gate_id) {
                Some(g) => g.pipe_inx_mask,
                None => return Vec::new(),
            }
        };
        mask_slots(mask)
            .filter_map(|slot| self.dyn_pipes.get(slot))
            .filter(|p| p.pipe_id != 0)
            .map(|p| p.pipe_id)
            .collect()
    }

    /// Allocates `gate_id`, or the first free generic gate when `None`
    pub fn alloc_gate(&mut self, gate_id: Option<GateId>, owner: AppHandle) -> Result<GateId> {
        let slot = self
            .dyn_gates
            .iter()
            .position(|g| g.gate_id == 0)
            .ok_or_else(|| Error::protocol("no free gate slot"))?;

        let gate_id = match gate_id {
            Some(id) => {
                if !is_valid_dynamic_gate(id) {
                    return Err(Error::protocol(format!("gate id {:#04x} cannot be allocated", id)));
                }
                if self.find_gate(id).is_some() {
                    return Err(Error::protocol(format!("gate {:#04x} already allocated", id)));
                }
                id
            }
            None => (gate::FIRST_HOST_SPECIFIC_GENERIC..=gate::LAST_HOST_SPECIFIC_GENERIC)
                .find(|&id| id != gate::CONNECTIVITY && self.find_gate(id).is_none())
                .ok_or_else(|| Error::protocol("no free generic gate id"))?,
        };

        self.dyn_gates[slot] = GateEntry {
            gate_id,
            gate_owner: owner.0,
            pipe_inx_mask: 0,
        };
        Ok(gate_id)
    }

    pub fn dealloc_gate(&mut self, gate_id: GateId) -> Option<GateEntry> {
        let slot = self.dyn_gates.iter().position(|g| g.gate_id == gate_id && gate_id != 0)?;
        Some(std::mem::take(&mut self.dyn_gates[slot]))
    }

    /// Gates owned by an application
    pub fn gates_of_app(&self, app: AppHandle) -> Vec<GateId> {
        self.dyn_gates
            .iter()
            .filter(|g| g.gate_id != 0 && g.gate_owner == app.0)
            .map(|g| g.gate_id)
            .collect()
    }

    /// Gate ids reported in the identity management gate list
    pub fn local_gate_list(&self) -> Vec<GateId> {
        let mut gates = vec![gate::LOOP_BACK, gate::IDENTITY_MANAGEMENT];
        gates.extend(self.dyn_gates.iter().filter(|g| g.gate_id != 0).map(|g| g.gate_id));
        gates
    }

    /// Registers an application by name.
    ///
    /// A name already present gets its old handle back, so gates and pipes
    /// survive a restart of the application.
    pub fn register_app(&mut self, name: &str, send_conn_evts: bool) -> Result<AppHandle> {
        if name.is_empty() || name.len() > MAX_APP_NAME_LEN {
            return Err(Error::protocol(format!("application name {:?}", name)));
        }
        let slot = match self.reg_app_names.iter().position(|n| n == name) {
            Some(slot) => slot,
            None => self
                .reg_app_names
                .iter()
                .position(|n| n.is_empty())
                .ok_or_else(|| Error::protocol("no free application slot"))?,
        };
        self.reg_app_names[slot] = name.to_string();
        self.send_conn_evts[slot] = send_conn_evts;
        Ok(AppHandle::from_index(slot))
    }

    pub fn deregister_app(&mut self, app: AppHandle) -> Result<()> {
        let slot = self
            .app_slot(app)
            .ok_or_else(|| Error::protocol(format!("application {:#06x} not registered", app.0)))?;
        self.reg_app_names[slot].clear();
        self.send_conn_evts[slot] = false;
        Ok(())
    }

    fn app_slot(&self, app: AppHandle) -> Option<usize> {
        app.index()
            .filter(|&i| i < self.reg_app_names.len() && !self.reg_app_names[i].is_empty())
    }

    pub fn is_registered(&self, app: AppHandle) -> bool {
        self.app_slot(app).is_some()
    }

    pub fn registered_apps(&self) -> Vec<AppHandle> {
        (0..self.reg_app_names.len())
            .filter(|&i| !self.reg_app_names[i].is_empty())
            .map(AppHandle::from_index)
            .collect()
    }

    /// Applications that asked for connectivity gate events
    pub fn conn_evt_apps(&self) -> Vec<AppHandle> {
        self.registered_apps()
            .into_iter()
            .filter(|app| app.index().map_or(false, |i| self.send_conn_evts[i]))
            .collect()
    }
}
