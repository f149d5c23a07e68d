//! Requests into and events out of the host-control state machine

use std::time::Duration;

use bytes::Bytes;

use crate::core::{AppHandle, GateId, HostId, NfceeId, PipeId, Status};

/// Application requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciRequest {
    Register { name: String, send_conn_evts: bool },
    Deregister { app: AppHandle },
    /// Allocate `gate`, or any free generic gate when `None`
    AllocGate { app: AppHandle, gate: Option<GateId> },
    DeallocGate { app: AppHandle, gate: GateId },
    CreatePipe { app: AppHandle, source_gate: GateId, dest_host: HostId, dest_gate: GateId },
    OpenPipe { app: AppHandle, pipe: PipeId },
    ClosePipe { app: AppHandle, pipe: PipeId },
    DeletePipe { app: AppHandle, pipe: PipeId },
    GetRegistry { app: AppHandle, pipe: PipeId, index: u8 },
    SetRegistry { app: AppHandle, pipe: PipeId, index: u8, data: Vec<u8> },
    SendCommand { app: AppHandle, pipe: PipeId, cmd: u8, data: Vec<u8> },
    /// Send an event; a non-zero `rsp_buf_size` waits for an answering
    /// event of at most that size
    SendEvent {
        app: AppHandle,
        pipe: PipeId,
        evt: u8,
        data: Vec<u8>,
        rsp_buf_size: usize,
        rsp_timeout: Option<Duration>,
    },
    /// Answer a command forwarded to the application
    SendResponse { app: AppHandle, pipe: PipeId, code: u8, data: Vec<u8> },
    GetHostList { app: AppHandle },
}

impl HciRequest {
    /// Handle of the requesting application, if it already has one
    pub fn app(&self) -> Option<AppHandle> {
        match self {
            HciRequest::Register { .. } => None,
            HciRequest::Deregister { app }
            | HciRequest::AllocGate { app, .. }
            | HciRequest::DeallocGate { app, .. }
            | HciRequest::CreatePipe { app, .. }
            | HciRequest::OpenPipe { app, .. }
            | HciRequest::ClosePipe { app, .. }
            | HciRequest::DeletePipe { app, .. }
            | HciRequest::GetRegistry { app, .. }
            | HciRequest::SetRegistry { app, .. }
            | HciRequest::SendCommand { app, .. }
            | HciRequest::SendEvent { app, .. }
            | HciRequest::SendResponse { app, .. }
            | HciRequest::GetHostList { app } => Some(*app),
        }
    }
}

/// Events delivered to applications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    /// The HCI network finished starting up
    Init { status: Status },
    Registered { status: Status, name: String, app: Option<AppHandle> },
    Deregistered { status: Status },
    GateAllocated { status: Status, gate: GateId },
    GateDeallocated { status: Status, gate: GateId },
    PipeCreated { status: Status, pipe: PipeId, source_gate: GateId, dest_host: HostId, dest_gate: GateId },
    PipeOpened { status: Status, pipe: PipeId },
    PipeClosed { status: Status, pipe: PipeId },
    PipeDeleted { status: Status, pipe: PipeId },
    /// A host dropped every pipe it had to us
    AllPipesCleared { host: HostId },
    RegistryRead { status: Status, pipe: PipeId, index: u8, data: Bytes },
    RegistryWritten { status: Status, pipe: PipeId, index: u8 },
    /// A command from another host on one of the application's pipes
    CommandReceived { pipe: PipeId, cmd: u8, data: Bytes },
    CommandResponse { status: Status, pipe: PipeId, code: u8, data: Bytes },
    EventReceived { status: Status, pipe: PipeId, evt: u8, data: Bytes },
    EventSent { status: Status, pipe: PipeId, evt: u8 },
    HostList { status: Status, hosts: Vec<HostId> },
}

/// Outbound effects of the state machine, executed by the service in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciAction {
    /// Send one HCP packet on an NCI logical connection
    Transmit { conn_id: u8, packet: Bytes },
    /// Arm the response timer; only the latest generation may fire
    StartTimer { generation: u64, duration: Duration },
    StopTimer,
    /// Deliver an event; `None` when no application handle exists yet
    Notify { app: Option<AppHandle>, event: HciEvent },
    /// Read the persisted configuration and feed it back
    LoadConfig,
    /// Store this configuration blob
    PersistConfig(Vec<u8>),
    /// Route static HCI connection traffic to the state machine
    BindStaticHci,
    SetNfceeMode { nfcee_id: NfceeId, activate: bool },
    StartRfDiscovery,
    /// Startup finished with this status
    EnableComplete(Status),
    /// A power mode change has been handled
    PowerModeProcComplete,
}

/// Receives application events and lifecycle results
pub trait HciListener: Send + Sync {
    fn on_hci_event(&self, app: Option<AppHandle>, event: &HciEvent);

    fn on_enable_complete(&self, _status: Status) {}

    fn on_power_mode_complete(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_app() {
        let app = AppHandle::from_index(2);
        assert_eq!(HciRequest::GetHostList { app }.app(), Some(app));
        let register = HciRequest::Register { name: "wallet".into(), send_conn_evts: false };
        assert_eq!(register.app(), None);
    }
}
