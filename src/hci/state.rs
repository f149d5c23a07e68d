use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::assembler::{select_receive_buffer, MessageAssembler};
use super::config::{HciTunables, HostControlConfig, PipeState};
use super::event::{HciAction, HciEvent, HciRequest};
use super::message::{parse_message_header, parse_packet_header, HcpMessage, MessageKind};
use super::{cmd, evt, gate, pipe, registry_index, rsp};
use crate::core::{AppHandle, GateId, HostId, NfceeId, PipeId, PowerMode, Result, SessionId, Status};
use crate::nci::{conn_id, VERSION_2_0};
use crate::util::hex;

/// Lifecycle of the host-control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HciState {
    /// Not started, or shut down
    Disabled,
    /// Reading configuration and opening the admin pipe
    Startup,
    /// Waiting for the other hosts to initialise the HCI network
    WaitNetworkEnable,
    Idle,
    /// A command or an answering event is outstanding
    WaitResponse,
    /// Re-establishing the network after leaving low power
    Restore,
    /// Deleting the pipes of a gate being deallocated
    RemoveGate,
    /// Deleting the pipes of an application being deregistered
    AppDeregister,
    /// An NFCEE is being recovered
    EeRecovery,
}

/// Activation status of an NFCEE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EeStatus {
    Active,
    Inactive,
    Removed,
}

/// Snapshot of one NFCEE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EeInfo {
    pub nfcee_id: NfceeId,
    pub status: EeStatus,
    /// Exposes the HCI access interface
    pub hci_access: bool,
}

/// Signals from the NFCEE manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EeDiscoveryStatus {
    /// NFCEE discovery completed
    Complete,
    /// NFCEE discovery was switched off
    Stopped,
    /// An NFCEE sent a discovery request
    Requested,
    RecoveryInit,
    RecoveryRediscovered,
    ModeSetComplete,
}

/// Synchronous queries answered by the NFCEE manager and the controller
pub trait EeManager: Send {
    fn nci_version(&self) -> u8;

    /// Current NFCEE snapshot
    fn ee_info(&self) -> Vec<EeInfo>;

    /// Requests a logical connection to the NFCEE's HCI access interface;
    /// the connection id arrives later through `on_connection_created`
    fn create_connection(&mut self, nfcee_id: NfceeId) -> Result<()>;

    /// Stops RF discovery; true if it was running
    fn stop_rf_discovery(&mut self) -> bool;

    fn start_rf_discovery(&mut self) -> Result<()>;

    /// Activates or deactivates an NFCEE; completion comes back as
    /// `EeDiscoveryStatus::ModeSetComplete`
    fn set_mode(&mut self, nfcee_id: NfceeId, activate: bool) -> Result<()>;
}

/// Host-control state machine.
///
/// Every entry point runs to completion and reports its effects as
/// `HciAction`s on the action channel; nothing here blocks or awaits.
pub struct HostControl<E: EeManager> {
    ee: E,
    action_tx: mpsc::UnboundedSender<HciAction>,
    tunables: HciTunables,
    config: HostControlConfig,
    state: HciState,

    nv_read_cmplt: bool,
    ee_disc_cmplt: bool,
    ee_disable_disc: bool,
    w4_hci_netwk_init: bool,
    /// Current startup was triggered by a return to full power
    restoring: bool,
    low_power: bool,
    conn_id: u8,
    ee_info: Vec<EeInfo>,
    num_nfcee: usize,
    num_ee_dis_req_ntf: usize,
    num_hot_plug_evts: usize,
    discovery_stopped: bool,

    cmd_sent: Option<u8>,
    pipe_in_use: PipeId,
    app_in_use: Option<AppHandle>,
    param_in_use: u8,
    gate_in_use: GateId,
    create_req: Option<(GateId, HostId, GateId)>,
    w4_rsp_evt: bool,
    rsp_buf_size: usize,

    assembler: MessageAssembler,
    assembling: bool,
    msg_pipe: PipeId,
    msg_kind: MessageKind,
    msg_instruction: u8,

    timer_generation: u64,
    armed_timer: Option<u64>,

    pending: VecDeque<HciRequest>,
    hosts: Vec<HostId>,
}

impl<E: EeManager> HostControl<E> {
    /// Creates a disabled state machine
    pub fn new(ee: E, action_tx: mpsc::UnboundedSender<HciAction>, tunables: HciTunables) -> Self {
        HostControl {
            ee,
            action_tx,
            tunables,
            config: HostControlConfig::default(),
            state: HciState::Disabled,
            nv_read_cmplt: false,
            ee_disc_cmplt: false,
            ee_disable_disc: false,
            w4_hci_netwk_init: false,
            restoring: false,
            low_power: false,
            conn_id: 0,
            ee_info: Vec::new(),
            num_nfcee: 0,
            num_ee_dis_req_ntf: 0,
            num_hot_plug_evts: 0,
            discovery_stopped: false,
            cmd_sent: None,
            pipe_in_use: 0,
            app_in_use: None,
            param_in_use: 0,
            gate_in_use: 0,
            create_req: None,
            w4_rsp_evt: false,
            rsp_buf_size: 0,
            assembler: MessageAssembler::new(),
            assembling: false,
            msg_pipe: 0,
            msg_kind: MessageKind::Command,
            msg_instruction: 0,
            timer_generation: 0,
            armed_timer: None,
            pending: VecDeque::new(),
            hosts: Vec::new(),
        }
    }

    pub fn state(&self) -> HciState {
        self.state
    }

    pub fn ee_mut(&mut self) -> &mut E {
        &mut self.ee
    }

    pub fn config(&self) -> &HostControlConfig {
        &self.config
    }

    pub fn is_low_power(&self) -> bool {
        self.low_power
    }

    /// Hosts reported by the last host list read
    pub fn hosts(&self) -> &[HostId] {
        &self.hosts
    }

    /// Allowed hosts missing from the last host list
    pub fn inactive_hosts(&self) -> Vec<HostId> {
        self.tunables
            .allowed_hosts
            .iter()
            .copied()
            .filter(|h| !self.hosts.contains(h))
            .collect()
    }

    /// Starts the layer: asks for the persisted configuration
    pub fn enable(&mut self) {
        if self.state != HciState::Disabled {
            warn!(state = ?self.state, "enable while already running");
            return;
        }
        self.nv_read_cmplt = false;
        self.ee_disc_cmplt = false;
        self.ee_disable_disc = false;
        self.w4_hci_netwk_init = true;
        self.restoring = false;
        self.low_power = false;
        self.conn_id = 0;
        self.num_ee_dis_req_ntf = 0;
        self.num_hot_plug_evts = 0;
        self.set_state(HciState::Startup);
        self.emit(HciAction::LoadConfig);
        self.start_timer(self.tunables.response_timeout);
    }

    /// Tears the layer down; safe in any state and when repeated
    pub fn disable(&mut self) {
        if self.state == HciState::Disabled {
            return;
        }
        self.stop_timer();
        self.persist();
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "dropping queued requests");
            self.pending.clear();
        }
        self.assembling = false;
        self.cmd_sent = None;
        self.w4_rsp_evt = false;
        self.rsp_buf_size = 0;
        self.conn_id = 0;
        self.set_state(HciState::Disabled);
    }

    /// Delivers the persisted configuration blob, if any was stored
    pub fn on_config_loaded(&mut self, bytes: Option<&[u8]>) {
        if self.state != HciState::Startup {
            warn!(state = ?self.state, "configuration delivered outside startup");
            return;
        }
        let (config, reset) = HostControlConfig::load_or_default(bytes);
        self.config = config;
        if reset {
            info!("starting with a fresh HCI configuration");
            self.persist();
        }
        self.nv_read_cmplt = true;
        self.stop_timer();
        self.startup();
    }

    /// Result of the connection requested from the NFCEE manager
    pub fn on_connection_created(&mut self, conn_id: u8, status: Status) {
        if !self.in_startup() {
            warn!(state = ?self.state, conn_id, "unexpected connection");
            return;
        }
        if !status.is_ok() {
            self.startup_complete(Status::Failed);
            return;
        }
        self.conn_id = conn_id;
        self.open_admin_pipe();
    }

    /// Handles a power mode change from the device manager
    pub fn on_power_mode(&mut self, mode: PowerMode) {
        match mode {
            PowerMode::Full => {
                if self.state != HciState::Idle {
                    error!(state = ?self.state, "full power requested while busy");
                    return;
                }
                self.low_power = false;
                self.restoring = true;
                self.set_state(HciState::Restore);
                self.ee_disc_cmplt = false;
                self.ee_disable_disc = true;
                self.w4_hci_netwk_init = self.num_nfcee > 1;
                self.conn_id = 0;
                self.num_ee_dis_req_ntf = 0;
                self.num_hot_plug_evts = 0;
                self.cmd_sent = None;
                self.w4_rsp_evt = false;
            }
            PowerMode::Low => {
                self.set_state(HciState::Idle);
                self.w4_rsp_evt = false;
                self.conn_id = 0;
                self.stop_timer();
                self.low_power = true;
                self.emit(HciAction::PowerModeProcComplete);
            }
        }
    }

    /// Signals from the NFCEE manager
    pub fn on_ee_status(&mut self, status: EeDiscoveryStatus) {
        debug!(?status, state = ?self.state, "NFCEE status");
        let last_peer = self.num_nfcee.saturating_sub(1);
        match status {
            EeDiscoveryStatus::Complete => {
                if !self.ee_disc_cmplt && self.in_startup_or_restore() {
                    self.ee_disc_cmplt = true;
                    self.refresh_ee_info();
                    if self.state == HciState::Startup && self.num_nfcee <= 1 {
                        self.w4_hci_netwk_init = false;
                    }
                    self.startup();
                }
            }
            EeDiscoveryStatus::Stopped => {
                if self.ee_disable_disc {
                    return;
                }
                self.ee_disable_disc = true;
                if self.state == HciState::WaitNetworkEnable {
                    if self.num_nfcee <= 1
                        || self.num_ee_dis_req_ntf == last_peer
                        || self.num_hot_plug_evts == last_peer
                    {
                        self.complete_network_init();
                    }
                } else if self.num_nfcee <= 1 {
                    self.w4_hci_netwk_init = false;
                }
            }
            EeDiscoveryStatus::Requested => {
                self.num_ee_dis_req_ntf += 1;
                if self.ee_disable_disc && self.num_ee_dis_req_ntf == last_peer {
                    if self.state == HciState::WaitNetworkEnable {
                        self.complete_network_init();
                    } else if self.in_startup_or_restore() {
                        self.w4_hci_netwk_init = false;
                    }
                }
            }
            EeDiscoveryStatus::RecoveryRediscovered | EeDiscoveryStatus::ModeSetComplete => {
                if matches!(self.state, HciState::WaitNetworkEnable | HciState::EeRecovery) {
                    self.ee_info.clear();
                    self.num_nfcee = 0;
                    self.refresh_ee_info();
                    self.enable_one_nfcee();
                }
            }
            EeDiscoveryStatus::RecoveryInit => {
                self.ee_info.clear();
                self.num_nfcee = 0;
                self.discovery_stopped = self.ee.stop_rf_discovery();
                self.set_state(HciState::EeRecovery);
            }
        }
    }

    /// Timer expiry posted by the service; stale generations are ignored
    pub fn on_timer_expired(&mut self, generation: u64) {
        if self.armed_timer != Some(generation) {
            debug!(generation, "stale timer");
            return;
        }
        self.armed_timer = None;
        self.rsp_timeout();
    }

    /// Accepts an application request, queueing it while busy
    pub fn handle_request(&mut self, request: HciRequest) {
        if self.state == HciState::Disabled {
            warn!(?request, "request while disabled");
            self.fail_request(&request, Status::Failed);
            return;
        }
        if self.state != HciState::Idle || self.low_power {
            debug!(state = ?self.state, "queueing request");
            self.pending.push_back(request);
            return;
        }
        self.execute_request(request);
    }

    /// One HCP packet received on an NCI logical connection
    pub fn on_hci_data(&mut self, conn_id: u8, data: &[u8]) {
        if self.state == HciState::Disabled {
            return;
        }
        if conn_id != self.conn_id {
            warn!(conn_id, expected = self.conn_id, "HCP data on foreign connection");
            return;
        }
        let Some((&header, mut body)) = data.split_first() else {
            warn!("empty HCP packet");
            return;
        };
        let (last, pipe) = parse_packet_header(header);

        if !self.assembling {
            let Some((&msg_header, rest)) = body.split_first() else {
                warn!(pipe, "HCP packet without message header");
                return;
            };
            let (kind, instruction) = match parse_message_header(msg_header) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "dropping HCP message");
                    return;
                }
            };
            body = rest;
            self.msg_pipe = pipe;
            self.msg_kind = kind;
            self.msg_instruction = instruction;
            let rsp_size = if self.w4_rsp_evt && pipe == self.pipe_in_use {
                self.rsp_buf_size
            } else {
                0
            };
            self.assembler.begin(select_receive_buffer(
                pipe,
                kind,
                rsp_size,
                self.tunables.max_message_len,
            ));
        } else if pipe != self.msg_pipe {
            warn!(pipe, assembling = self.msg_pipe, "HCP fragment for another pipe");
            return;
        }

        self.assembler.assemble(body);
        if !last {
            self.assembling = true;
            return;
        }
        self.assembling = false;

        let failed = self.assembler.assembly_failed();
        let message = self.assembler.take();
        if failed {
            warn!(pipe, len = message.len(), "HCP message overflowed its receive buffer");
        }
        debug!(pipe, kind = ?self.msg_kind, instruction = self.msg_instruction, data = %hex(&message), "HCP message");

        match self.msg_kind {
            MessageKind::Response => self.handle_response(pipe, self.msg_instruction, message, failed),
            MessageKind::Command => self.handle_command(pipe, self.msg_instruction, message, failed),
            MessageKind::Event => self.handle_event(pipe, self.msg_instruction, message, failed),
        }
    }

    // ---- startup ----

    fn startup(&mut self) {
        if self.tunables.loopback_debug {
            if self.conn_id == 0 {
                self.emit(HciAction::BindStaticHci);
                self.conn_id = conn_id::STATIC_HCI;
            }
            self.open_admin_pipe();
            return;
        }
        if !(self.nv_read_cmplt && self.ee_disc_cmplt) {
            debug!(nv = self.nv_read_cmplt, ee = self.ee_disc_cmplt, "startup waiting");
            return;
        }
        if self.conn_id != 0 {
            return;
        }

        self.emit(HciAction::BindStaticHci);
        if self.ee.nci_version() < VERSION_2_0 {
            self.conn_id = conn_id::STATIC_HCI;
            self.open_admin_pipe();
            return;
        }

        let Some(ee) = self.ee_info.iter().find(|e| e.hci_access).cloned() else {
            warn!("no NFCEE exposes HCI access");
            self.startup_complete(Status::Failed);
            return;
        };
        if ee.status == EeStatus::Inactive {
            self.emit(HciAction::SetNfceeMode {
                nfcee_id: ee.nfcee_id,
                activate: true,
            });
        }
        if let Err(e) = self.ee.create_connection(ee.nfcee_id) {
            warn!(error = %e, nfcee = ee.nfcee_id, "HCI connection not created");
            self.startup_complete(Status::Failed);
        }
    }

    fn open_admin_pipe(&mut self) {
        self.pipe_in_use = pipe::ADMIN;
        self.send_command(pipe::ADMIN, cmd::ANY_OPEN_PIPE, Vec::new());
    }

    fn get_host_list(&mut self) {
        self.pipe_in_use = pipe::ADMIN;
        self.param_in_use = registry_index::HOST_LIST;
        self.send_command(pipe::ADMIN, cmd::ANY_GET_PARAMETER, vec![registry_index::HOST_LIST]);
    }

    /// Admin pipe is open and the session identity agreed
    fn network_ready(&mut self) {
        if self.w4_hci_netwk_init {
            self.set_state(HciState::WaitNetworkEnable);
            self.start_timer(self.tunables.network_enable_timeout);
        } else {
            self.get_host_list();
        }
    }

    fn complete_network_init(&mut self) {
        self.stop_timer();
        self.w4_hci_netwk_init = false;
        self.get_host_list();
    }

    fn startup_complete(&mut self, status: Status) {
        info!(?status, restoring = self.restoring, "HCI startup complete");
        self.stop_timer();
        self.cmd_sent = None;
        if self.restoring {
            self.restoring = false;
            self.emit(HciAction::PowerModeProcComplete);
        } else {
            self.notify_all(HciEvent::Init { status });
            self.emit(HciAction::EnableComplete(status));
        }
        if status.is_ok() {
            self.set_state(HciState::Idle);
            self.check_api_requests();
        } else {
            self.set_state(HciState::Disabled);
        }
    }

    fn refresh_ee_info(&mut self) {
        self.ee_info = self.ee.ee_info();
        self.num_nfcee = self.ee_info.len();
    }

    fn enable_one_nfcee(&mut self) {
        if let Some(ee) = self.ee_info.iter().find(|e| e.status == EeStatus::Inactive) {
            let nfcee_id = ee.nfcee_id;
            self.emit(HciAction::SetNfceeMode { nfcee_id, activate: true });
            return;
        }
        match self.state {
            HciState::WaitNetworkEnable => self.complete_network_init(),
            HciState::EeRecovery => {
                self.set_state(HciState::Idle);
                if self.discovery_stopped {
                    self.discovery_stopped = false;
                    self.emit(HciAction::StartRfDiscovery);
                }
                self.check_api_requests();
            }
            _ => {}
        }
    }

    // ---- timeouts ----

    fn rsp_timeout(&mut self) {
        debug!(state = ?self.state, cmd = ?self.cmd_sent, "response timeout");
        match self.state {
            HciState::Startup | HciState::Restore => self.startup_complete(Status::Timeout),
            HciState::WaitNetworkEnable => {
                if self.w4_hci_netwk_init {
                    self.w4_hci_netwk_init = false;
                    self.get_host_list();
                } else {
                    self.startup_complete(Status::Failed);
                }
            }
            HciState::RemoveGate | HciState::AppDeregister => {
                if self.cmd_sent == Some(cmd::ADM_DELETE_PIPE) {
                    self.pipe_in_use = pipe::ADMIN;
                    self.send_command(pipe::ADMIN, cmd::ADM_CLEAR_ALL_PIPE, Vec::new());
                } else {
                    self.cmd_sent = None;
                    self.config.remove_all_pipes_from_host(None);
                    if self.state == HciState::RemoveGate {
                        self.finish_gate_dealloc();
                    } else {
                        self.finish_deregistration();
                    }
                }
            }
            HciState::WaitResponse => self.wait_response_timeout(),
            HciState::Disabled | HciState::Idle | HciState::EeRecovery => {
                debug!(state = ?self.state, "timeout ignored");
            }
        }
    }

    fn wait_response_timeout(&mut self) {
        let pipe = self.pipe_in_use;
        if self.w4_rsp_evt {
            self.w4_rsp_evt = false;
            self.rsp_buf_size = 0;
            self.cmd_sent = None;
            self.notify(
                self.app_in_use,
                HciEvent::EventReceived {
                    status: Status::Timeout,
                    pipe,
                    evt: 0,
                    data: Bytes::new(),
                },
            );
            self.start_timer(self.tunables.response_timeout);
            return;
        }

        let app = self.app_in_use;
        let status = Status::Timeout;
        let (event, drop_pipe) = match self.cmd_sent.take() {
            Some(cmd::ANY_SET_PARAMETER) => (
                Some(HciEvent::RegistryWritten { status, pipe, index: self.param_in_use }),
                true,
            ),
            Some(cmd::ANY_GET_PARAMETER) if pipe == pipe::ADMIN => (
                Some(HciEvent::HostList { status, hosts: Vec::new() }),
                false,
            ),
            Some(cmd::ANY_GET_PARAMETER) => (
                Some(HciEvent::RegistryRead { status, pipe, index: self.param_in_use, data: Bytes::new() }),
                true,
            ),
            Some(cmd::ANY_OPEN_PIPE) => (Some(HciEvent::PipeOpened { status, pipe }), true),
            Some(cmd::ANY_CLOSE_PIPE) => (Some(HciEvent::PipeClosed { status, pipe }), true),
            Some(cmd::ADM_CREATE_PIPE) => {
                let (source_gate, dest_host, dest_gate) = self.create_req.take().unwrap_or_default();
                (
                    Some(HciEvent::PipeCreated { status, pipe: 0, source_gate, dest_host, dest_gate }),
                    false,
                )
            }
            Some(cmd::ADM_DELETE_PIPE) => {
                self.config.release_pipe(pipe);
                self.persist();
                (Some(HciEvent::PipeDeleted { status, pipe }), false)
            }
            Some(code) => (
                Some(HciEvent::CommandResponse { status, pipe, code, data: Bytes::new() }),
                true,
            ),
            None => (None, false),
        };

        if let Some(event) = event {
            self.notify(app, event);
        }
        self.app_in_use = None;

        if drop_pipe && super::is_dynamic_pipe(pipe) {
            warn!(pipe, "host stopped answering; deleting pipe");
            self.send_command(pipe::ADMIN, cmd::ADM_DELETE_PIPE, vec![pipe]);
            self.config.release_pipe(pipe);
            self.persist();
        } else {
            self.set_state(HciState::Idle);
            self.check_api_requests();
        }
    }

    // ---- inbound ----

    fn handle_response(&mut self, pipe: PipeId, code: u8, data: Bytes, failed: bool) {
        let Some(sent) = self.cmd_sent.take() else {
            warn!(pipe, code, "unsolicited response");
            return;
        };
        self.stop_timer();
        let status = if failed {
            Status::BufferFull
        } else if code == rsp::ANY_OK {
            Status::Ok
        } else {
            Status::Failed
        };
        if self.state == HciState::WaitResponse {
            self.set_state(HciState::Idle);
        }

        if pipe == pipe::ADMIN {
            self.admin_response(sent, status, data);
        } else {
            self.pipe_response(pipe, sent, code, status, data);
        }

        if self.state == HciState::Idle {
            self.check_api_requests();
        }
    }

    fn admin_response(&mut self, sent: u8, status: Status, data: Bytes) {
        if self.in_startup() {
            self.startup_response(sent, status, data);
            return;
        }

        let app = self.app_in_use;
        match sent {
            cmd::ADM_CREATE_PIPE => {
                let (source_gate, dest_host, dest_gate) = self.create_req.take().unwrap_or_default();
                let created = if status.is_ok() && data.len() >= 5 {
                    let pipe = data[4];
                    match self.config.alloc_pipe(pipe, source_gate, dest_host, dest_gate) {
                        Ok(()) => {
                            self.persist();
                            Some(pipe)
                        }
                        Err(e) => {
                            warn!(error = %e, "created pipe not recorded");
                            None
                        }
                    }
                } else {
                    None
                };
                let event = HciEvent::PipeCreated {
                    status: if created.is_some() { Status::Ok } else { Status::Failed },
                    pipe: created.unwrap_or(0),
                    source_gate,
                    dest_host,
                    dest_gate,
                };
                self.notify(app, event);
            }
            cmd::ADM_DELETE_PIPE => {
                let pipe = self.pipe_in_use;
                if status.is_ok() || self.in_teardown() {
                    self.config.release_pipe(pipe);
                    self.persist();
                }
                match self.state {
                    HciState::RemoveGate => self.continue_gate_teardown(),
                    HciState::AppDeregister => self.continue_deregistration(),
                    _ if app.is_some() => self.notify(app, HciEvent::PipeDeleted { status, pipe }),
                    _ => debug!(pipe, ?status, "internal pipe delete acknowledged"),
                }
            }
            cmd::ADM_CLEAR_ALL_PIPE => {
                if self.in_teardown() {
                    self.config.remove_all_pipes_from_host(None);
                    self.persist();
                    if self.state == HciState::RemoveGate {
                        self.finish_gate_dealloc();
                    } else {
                        self.finish_deregistration();
                    }
                }
            }
            cmd::ANY_GET_PARAMETER if self.param_in_use == registry_index::HOST_LIST => {
                if status.is_ok() {
                    self.hosts = data.to_vec();
                }
                let hosts = self.hosts.clone();
                self.notify(app, HciEvent::HostList { status, hosts });
            }
            cmd::ANY_GET_PARAMETER => {
                let event = HciEvent::RegistryRead { status, pipe: pipe::ADMIN, index: self.param_in_use, data };
                self.notify(app, event);
            }
            cmd::ANY_SET_PARAMETER => {
                let event = HciEvent::RegistryWritten { status, pipe: pipe::ADMIN, index: self.param_in_use };
                self.notify(app, event);
            }
            other => debug!(cmd = other, ?status, "admin response"),
        }
        if !self.in_teardown() {
            self.app_in_use = None;
        }
    }

    fn startup_response(&mut self, sent: u8, status: Status, data: Bytes) {
        match (sent, self.param_in_use) {
            (cmd::ANY_OPEN_PIPE, _) => {
                if !status.is_ok() {
                    self.startup_complete(Status::Failed);
                    return;
                }
                self.config.admin_pipe_state = PipeState::Opened.code();
                self.param_in_use = registry_index::SESSION_IDENTITY;
                self.send_command(pipe::ADMIN, cmd::ANY_GET_PARAMETER, vec![registry_index::SESSION_IDENTITY]);
            }
            (cmd::ANY_GET_PARAMETER, registry_index::SESSION_IDENTITY) => {
                let same = status.is_ok()
                    && self.config.session_id != SessionId::UNSET
                    && data.as_ref() == self.config.session_id.0.as_slice();
                if same {
                    self.network_ready();
                    return;
                }
                info!(stored = %hex(&self.config.session_id.0), reported = %hex(&data), "new HCI session");
                self.config.session_id = SessionId::random();
                self.config.remove_all_pipes_from_host(None);
                self.persist();
                let mut param = vec![registry_index::SESSION_IDENTITY];
                param.extend_from_slice(&self.config.session_id.0);
                self.send_command(pipe::ADMIN, cmd::ANY_SET_PARAMETER, param);
            }
            (cmd::ANY_SET_PARAMETER, registry_index::SESSION_IDENTITY) => {
                if status.is_ok() {
                    self.network_ready();
                } else {
                    self.startup_complete(Status::Failed);
                }
            }
            (cmd::ANY_GET_PARAMETER, registry_index::HOST_LIST) => {
                if status.is_ok() {
                    self.hosts = data.to_vec();
                    self.startup_complete(Status::Ok);
                } else {
                    self.startup_complete(Status::Failed);
                }
            }
            (other, index) => warn!(cmd = other, index, "unexpected startup response"),
        }
    }

    fn pipe_response(&mut self, pipe: PipeId, sent: u8, code: u8, status: Status, data: Bytes) {
        if pipe != self.pipe_in_use {
            warn!(pipe, expected = self.pipe_in_use, "response on unexpected pipe");
        }
        let app = self.app_in_use.take();
        let event = match sent {
            cmd::ANY_OPEN_PIPE => {
                if status.is_ok() {
                    self.config.set_pipe_state(pipe, PipeState::Opened);
                    self.persist();
                }
                HciEvent::PipeOpened { status, pipe }
            }
            cmd::ANY_CLOSE_PIPE => {
                if status.is_ok() {
                    self.config.set_pipe_state(pipe, PipeState::Closed);
                    self.persist();
                }
                HciEvent::PipeClosed { status, pipe }
            }
            cmd::ANY_GET_PARAMETER => HciEvent::RegistryRead { status, pipe, index: self.param_in_use, data },
            cmd::ANY_SET_PARAMETER => HciEvent::RegistryWritten { status, pipe, index: self.param_in_use },
            _ => HciEvent::CommandResponse { status, pipe, code, data },
        };
        self.notify(app, event);
    }

    fn handle_command(&mut self, pipe: PipeId, instruction: u8, data: Bytes, failed: bool) {
        if failed {
            self.respond(pipe, rsp::ANY_E_NOK, Vec::new());
            return;
        }
        match pipe {
            pipe::ADMIN => self.admin_command(instruction, &data),
            pipe::LINK_MANAGEMENT => self.respond(pipe, rsp::ANY_E_CMD_NOT_SUPPORTED, Vec::new()),
            _ => self.pipe_command(pipe, instruction, data),
        }
    }

    fn admin_command(&mut self, instruction: u8, data: &[u8]) {
        match instruction {
            cmd::ADM_NOTIFY_PIPE_CREATED => {
                let Some(&[src_host, src_gate, _dest_host, dest_gate, new_pipe]) = data.get(..5) else {
                    self.respond(pipe::ADMIN, rsp::ANY_E_CMD_PAR_UNKNOWN, Vec::new());
                    return;
                };
                if !self.tunables.is_host_allowed(src_host) {
                    warn!(host = src_host, "pipe creation from host not on the allow list");
                    self.respond(pipe::ADMIN, rsp::ANY_E_NOK, Vec::new());
                    return;
                }
                match self.config.alloc_pipe(new_pipe, dest_gate, src_host, src_gate) {
                    Ok(()) => {
                        self.persist();
                        self.respond(pipe::ADMIN, rsp::ANY_OK, Vec::new());
                        let owner = self.config.pipe_owner(new_pipe);
                        self.notify(
                            owner,
                            HciEvent::PipeCreated {
                                status: Status::Ok,
                                pipe: new_pipe,
                                source_gate: dest_gate,
                                dest_host: src_host,
                                dest_gate: src_gate,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "refusing pipe");
                        self.respond(pipe::ADMIN, rsp::ADM_E_NO_PIPES_AVAILABLE, Vec::new());
                    }
                }
            }
            cmd::ADM_NOTIFY_PIPE_DELETED => {
                let Some(&deleted) = data.first() else {
                    self.respond(pipe::ADMIN, rsp::ANY_E_CMD_PAR_UNKNOWN, Vec::new());
                    return;
                };
                let owner = self.config.pipe_owner(deleted);
                self.config.release_pipe(deleted);
                self.persist();
                self.respond(pipe::ADMIN, rsp::ANY_OK, Vec::new());
                self.notify(owner, HciEvent::PipeDeleted { status: Status::Ok, pipe: deleted });
            }
            cmd::ADM_NOTIFY_ALL_PIPE_CLEARED => {
                let Some(&host) = data.first() else {
                    self.respond(pipe::ADMIN, rsp::ANY_E_CMD_PAR_UNKNOWN, Vec::new());
                    return;
                };
                let removed = self.config.remove_all_pipes_from_host(Some(host));
                debug!(host, count = removed.len(), "host cleared its pipes");
                self.persist();
                self.respond(pipe::ADMIN, rsp::ANY_OK, Vec::new());
                self.notify_all(HciEvent::AllPipesCleared { host });
            }
            cmd::ANY_OPEN_PIPE => {
                self.config.admin_pipe_state = PipeState::Opened.code();
                self.respond(pipe::ADMIN, rsp::ANY_OK, Vec::new());
            }
            other => {
                debug!(cmd = other, "admin command not supported");
                self.respond(pipe::ADMIN, rsp::ANY_E_CMD_NOT_SUPPORTED, Vec::new());
            }
        }
    }

    fn pipe_command(&mut self, pipe: PipeId, instruction: u8, data: Bytes) {
        let Some(entry) = self.config.find_pipe(pipe).copied() else {
            warn!(pipe, "command on unknown pipe");
            self.respond(pipe, rsp::ANY_E_NOK, Vec::new());
            return;
        };
        let owner = self.config.pipe_owner(pipe);

        match instruction {
            cmd::ANY_OPEN_PIPE => {
                self.config.set_pipe_state(pipe, PipeState::Opened);
                self.persist();
                self.respond(pipe, rsp::ANY_OK, Vec::new());
                self.notify(owner, HciEvent::PipeOpened { status: Status::Ok, pipe });
            }
            cmd::ANY_CLOSE_PIPE => {
                self.config.set_pipe_state(pipe, PipeState::Closed);
                self.persist();
                self.respond(pipe, rsp::ANY_OK, Vec::new());
                self.notify(owner, HciEvent::PipeClosed { status: Status::Ok, pipe });
            }
            _ if entry.state() != Some(PipeState::Opened) => {
                self.respond(pipe, rsp::ANY_E_PIPE_NOT_OPENED, Vec::new());
            }
            cmd::ANY_GET_PARAMETER if entry.local_gate == gate::IDENTITY_MANAGEMENT => {
                match data.first() {
                    Some(&registry_index::GATES_LIST) => {
                        let gates = self.config.local_gate_list();
                        self.respond(pipe, rsp::ANY_OK, gates);
                    }
                    _ => self.respond(pipe, rsp::ANY_E_REG_PAR_UNKNOWN, Vec::new()),
                }
            }
            _ => match owner {
                Some(app) => self.notify(Some(app), HciEvent::CommandReceived { pipe, cmd: instruction, data }),
                None => self.respond(pipe, rsp::ANY_E_CMD_NOT_SUPPORTED, Vec::new()),
            },
        }
    }

    fn handle_event(&mut self, pipe: PipeId, instruction: u8, data: Bytes, failed: bool) {
        let status = if failed { Status::BufferFull } else { Status::Ok };

        if pipe == pipe::ADMIN {
            if instruction == evt::HOT_PLUG {
                self.num_hot_plug_evts += 1;
                debug!(count = self.num_hot_plug_evts, "hot plug event");
                if self.state == HciState::WaitNetworkEnable
                    && self.ee_disable_disc
                    && self.num_hot_plug_evts == self.num_nfcee.saturating_sub(1)
                {
                    self.complete_network_init();
                }
            } else {
                debug!(evt = instruction, "admin event ignored");
            }
            return;
        }

        if self.state == HciState::WaitResponse && self.w4_rsp_evt && pipe == self.pipe_in_use {
            self.stop_timer();
            self.w4_rsp_evt = false;
            self.rsp_buf_size = 0;
            let app = self.app_in_use.take();
            self.set_state(HciState::Idle);
            self.notify(app, HciEvent::EventReceived { status, pipe, evt: instruction, data });
            self.check_api_requests();
            return;
        }

        let Some(entry) = self.config.find_pipe(pipe).copied() else {
            warn!(pipe, evt = instruction, "event on unknown pipe");
            return;
        };
        if entry.local_gate == gate::LOOP_BACK && instruction == evt::POST_DATA {
            self.send_hcp(HcpMessage::event(pipe, evt::POST_DATA, data.to_vec()));
            return;
        }

        let owner = self.config.pipe_owner(pipe);
        let event = HciEvent::EventReceived { status, pipe, evt: instruction, data };
        if entry.local_gate == gate::CONNECTIVITY {
            for app in self.config.conn_evt_apps() {
                if Some(app) != owner {
                    self.notify(Some(app), event.clone());
                }
            }
        }
        if owner.is_some() {
            self.notify(owner, event);
        }
    }

    // ---- application requests ----

    fn check_api_requests(&mut self) {
        while self.state == HciState::Idle && !self.low_power {
            match self.pending.pop_front() {
                Some(request) => self.execute_request(request),
                None => break,
            }
        }
    }

    fn execute_request(&mut self, request: HciRequest) {
        if let Some(app) = request.app() {
            if !self.config.is_registered(app) {
                warn!(app = app.0, "request from unregistered application");
                self.fail_request(&request, Status::Rejected);
                return;
            }
        }

        match request {
            HciRequest::Register { name, send_conn_evts } => match self.config.register_app(&name, send_conn_evts) {
                Ok(app) => {
                    self.persist();
                    self.notify(Some(app), HciEvent::Registered { status: Status::Ok, name, app: Some(app) });
                }
                Err(e) => {
                    warn!(error = %e, "registration failed");
                    self.notify(None, HciEvent::Registered { status: Status::Failed, name, app: None });
                }
            },
            HciRequest::Deregister { app } => {
                self.app_in_use = Some(app);
                self.set_state(HciState::AppDeregister);
                self.continue_deregistration();
            }
            HciRequest::AllocGate { app, gate } => {
                let event = match self.config.alloc_gate(gate, app) {
                    Ok(gate) => {
                        self.persist();
                        HciEvent::GateAllocated { status: Status::Ok, gate }
                    }
                    Err(e) => {
                        warn!(error = %e, "gate allocation failed");
                        HciEvent::GateAllocated { status: Status::Failed, gate: gate.unwrap_or(0) }
                    }
                };
                self.notify(Some(app), event);
            }
            HciRequest::DeallocGate { app, gate } => {
                if self.config.find_gate(gate).map(|g| g.gate_owner) != Some(app.0) {
                    self.notify(Some(app), HciEvent::GateDeallocated { status: Status::Rejected, gate });
                    return;
                }
                self.app_in_use = Some(app);
                self.gate_in_use = gate;
                self.set_state(HciState::RemoveGate);
                self.continue_gate_teardown();
            }
            HciRequest::CreatePipe { app, source_gate, dest_host, dest_gate } => {
                let owned = self.config.find_gate(source_gate).map(|g| g.gate_owner) == Some(app.0);
                if !owned || !self.tunables.is_host_allowed(dest_host) {
                    let event = HciEvent::PipeCreated { status: Status::Rejected, pipe: 0, source_gate, dest_host, dest_gate };
                    self.notify(Some(app), event);
                    return;
                }
                self.app_in_use = Some(app);
                self.pipe_in_use = pipe::ADMIN;
                self.create_req = Some((source_gate, dest_host, dest_gate));
                self.send_command(pipe::ADMIN, cmd::ADM_CREATE_PIPE, vec![source_gate, dest_host, dest_gate]);
            }
            HciRequest::OpenPipe { app, pipe } => {
                if self.check_pipe(app, pipe, false) {
                    self.pipe_command_request(app, pipe, cmd::ANY_OPEN_PIPE, Vec::new());
                } else {
                    self.notify(Some(app), HciEvent::PipeOpened { status: Status::Rejected, pipe });
                }
            }
            HciRequest::ClosePipe { app, pipe } => {
                if self.check_pipe(app, pipe, false) {
                    self.pipe_command_request(app, pipe, cmd::ANY_CLOSE_PIPE, Vec::new());
                } else {
                    self.notify(Some(app), HciEvent::PipeClosed { status: Status::Rejected, pipe });
                }
            }
            HciRequest::DeletePipe { app, pipe } => {
                if self.check_pipe(app, pipe, false) {
                    self.app_in_use = Some(app);
                    self.pipe_in_use = pipe;
                    self.send_command(pipe::ADMIN, cmd::ADM_DELETE_PIPE, vec![pipe]);
                } else {
                    self.notify(Some(app), HciEvent::PipeDeleted { status: Status::Rejected, pipe });
                }
            }
            HciRequest::GetRegistry { app, pipe, index } => {
                if self.check_pipe(app, pipe, true) {
                    self.param_in_use = index;
                    self.pipe_command_request(app, pipe, cmd::ANY_GET_PARAMETER, vec![index]);
                } else {
                    let event = HciEvent::RegistryRead { status: Status::Rejected, pipe, index, data: Bytes::new() };
                    self.notify(Some(app), event);
                }
            }
            HciRequest::SetRegistry { app, pipe, index, data } => {
                if self.check_pipe(app, pipe, true) {
                    self.param_in_use = index;
                    let mut param = vec![index];
                    param.extend_from_slice(&data);
                    self.pipe_command_request(app, pipe, cmd::ANY_SET_PARAMETER, param);
                } else {
                    self.notify(Some(app), HciEvent::RegistryWritten { status: Status::Rejected, pipe, index });
                }
            }
            HciRequest::SendCommand { app, pipe, cmd, data } => {
                if self.check_pipe(app, pipe, true) {
                    self.pipe_command_request(app, pipe, cmd, data);
                } else {
                    let event = HciEvent::CommandResponse { status: Status::Rejected, pipe, code: cmd, data: Bytes::new() };
                    self.notify(Some(app), event);
                }
            }
            HciRequest::SendEvent { app, pipe, evt, data, rsp_buf_size, rsp_timeout } => {
                if !self.check_pipe(app, pipe, true) {
                    self.notify(Some(app), HciEvent::EventSent { status: Status::Rejected, pipe, evt });
                    return;
                }
                self.send_hcp(HcpMessage::event(pipe, evt, data));
                if rsp_buf_size > 0 {
                    self.w4_rsp_evt = true;
                    self.rsp_buf_size = rsp_buf_size;
                    self.pipe_in_use = pipe;
                    self.app_in_use = Some(app);
                    self.set_state(HciState::WaitResponse);
                    self.start_timer(rsp_timeout.unwrap_or(self.tunables.response_timeout));
                }
                self.notify(Some(app), HciEvent::EventSent { status: Status::Ok, pipe, evt });
            }
            HciRequest::SendResponse { app, pipe, code, data } => {
                if self.check_pipe(app, pipe, false) {
                    self.respond(pipe, code, data);
                } else {
                    warn!(app = app.0, pipe, "response on a pipe the application does not own");
                }
            }
            HciRequest::GetHostList { app } => {
                self.app_in_use = Some(app);
                self.get_host_list();
            }
        }
    }

    fn pipe_command_request(&mut self, app: AppHandle, pipe: PipeId, cmd: u8, data: Vec<u8>) {
        self.app_in_use = Some(app);
        self.pipe_in_use = pipe;
        self.send_command(pipe, cmd, data);
    }

    /// The pipe exists, belongs to `app` and, if asked, is open
    fn check_pipe(&self, app: AppHandle, pipe: PipeId, need_open: bool) -> bool {
        let Some(entry) = self.config.find_pipe(pipe) else {
            return false;
        };
        self.config.pipe_owner(pipe) == Some(app) && (!need_open || entry.state() == Some(PipeState::Opened))
    }

    fn fail_request(&mut self, request: &HciRequest, status: Status) {
        let app = request.app();
        let event = match request.clone() {
            HciRequest::Register { name, .. } => HciEvent::Registered { status, name, app: None },
            HciRequest::Deregister { .. } => HciEvent::Deregistered { status },
            HciRequest::AllocGate { gate, .. } => HciEvent::GateAllocated { status, gate: gate.unwrap_or(0) },
            HciRequest::DeallocGate { gate, .. } => HciEvent::GateDeallocated { status, gate },
            HciRequest::CreatePipe { source_gate, dest_host, dest_gate, .. } => {
                HciEvent::PipeCreated { status, pipe: 0, source_gate, dest_host, dest_gate }
            }
            HciRequest::OpenPipe { pipe, .. } => HciEvent::PipeOpened { status, pipe },
            HciRequest::ClosePipe { pipe, .. } => HciEvent::PipeClosed { status, pipe },
            HciRequest::DeletePipe { pipe, .. } => HciEvent::PipeDeleted { status, pipe },
            HciRequest::GetRegistry { pipe, index, .. } => HciEvent::RegistryRead { status, pipe, index, data: Bytes::new() },
            HciRequest::SetRegistry { pipe, index, .. } => HciEvent::RegistryWritten { status, pipe, index },
            HciRequest::SendCommand { pipe, cmd, .. } => {
                HciEvent::CommandResponse { status, pipe, code: cmd, data: Bytes::new() }
            }
            HciRequest::SendEvent { pipe, evt, .. } => HciEvent::EventSent { status, pipe, evt },
            HciRequest::SendResponse { .. } => return,
            HciRequest::GetHostList { .. } => HciEvent::HostList { status, hosts: Vec::new() },
        };
        self.notify(app, event);
    }

    // ---- teardown ----

    /// Sends ADM_DELETE_PIPE for the first pipe left on `gates`
    fn delete_next_pipe(&mut self, gates: &[GateId]) -> bool {
        let next = gates.iter().find_map(|&g| self.config.pipes_of_gate(g).first().copied());
        match next {
            Some(pipe) => {
                self.pipe_in_use = pipe;
                self.send_command(pipe::ADMIN, cmd::ADM_DELETE_PIPE, vec![pipe]);
                true
            }
            None => false,
        }
    }

    fn continue_gate_teardown(&mut self) {
        if !self.delete_next_pipe(&[self.gate_in_use]) {
            self.finish_gate_dealloc();
        }
    }

    fn finish_gate_dealloc(&mut self) {
        let gate = self.gate_in_use;
        let status = if self.config.dealloc_gate(gate).is_some() { Status::Ok } else { Status::Failed };
        self.persist();
        let app = self.app_in_use.take();
        self.notify(app, HciEvent::GateDeallocated { status, gate });
        self.set_state(HciState::Idle);
        self.check_api_requests();
    }

    fn continue_deregistration(&mut self) {
        let Some(app) = self.app_in_use else {
            self.set_state(HciState::Idle);
            return;
        };
        let gates = self.config.gates_of_app(app);
        if !self.delete_next_pipe(&gates) {
            self.finish_deregistration();
        }
    }

    fn finish_deregistration(&mut self) {
        if let Some(app) = self.app_in_use.take() {
            for gate in self.config.gates_of_app(app) {
                self.config.dealloc_gate(gate);
            }
            let status = match self.config.deregister_app(app) {
                Ok(()) => Status::Ok,
                Err(_) => Status::Failed,
            };
            self.persist();
            self.notify(Some(app), HciEvent::Deregistered { status });
        }
        self.set_state(HciState::Idle);
        self.check_api_requests();
    }

    // ---- outbound ----

    fn send_command(&mut self, pipe: PipeId, cmd: u8, data: Vec<u8>) {
        self.cmd_sent = Some(cmd);
        self.send_hcp(HcpMessage::command(pipe, cmd, data));
        if self.state == HciState::Idle {
            self.set_state(HciState::WaitResponse);
        }
        self.start_timer(self.tunables.response_timeout);
    }

    fn respond(&mut self, pipe: PipeId, code: u8, data: Vec<u8>) {
        self.send_hcp(HcpMessage::response(pipe, code, data));
    }

    fn send_hcp(&mut self, message: HcpMessage) {
        for packet in message.fragments(self.tunables.max_fragment_len) {
            self.emit(HciAction::Transmit {
                conn_id: self.conn_id,
                packet,
            });
        }
    }

    fn notify(&mut self, app: Option<AppHandle>, event: HciEvent) {
        self.emit(HciAction::Notify { app, event });
    }

    fn notify_all(&mut self, event: HciEvent) {
        for app in self.config.registered_apps() {
            self.notify(Some(app), event.clone());
        }
    }

    fn persist(&mut self) {
        match self.config.to_bytes() {
            Ok(bytes) => self.emit(HciAction::PersistConfig(bytes)),
            Err(e) => error!(error = %e, "HCI configuration not persisted"),
        }
    }

    fn start_timer(&mut self, duration: Duration) {
        self.timer_generation += 1;
        self.armed_timer = Some(self.timer_generation);
        self.emit(HciAction::StartTimer {
            generation: self.timer_generation,
            duration,
        });
    }

    fn stop_timer(&mut self) {
        if self.armed_timer.take().is_some() {
            self.emit(HciAction::StopTimer);
        }
    }

    fn emit(&self, action: HciAction) {
        if self.action_tx.send(action).is_err() {
            warn!("HCI action receiver dropped");
        }
    }

    fn set_state(&mut self, state: HciState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "HCI state change");
            self.state = state;
        }
    }

    fn in_startup(&self) -> bool {
        matches!(
            self.state,
            HciState::Startup | HciState::Restore | HciState::WaitNetworkEnable
        )
    }

    fn in_startup_or_restore(&self) -> bool {
        matches!(self.state, HciState::Startup | HciState::Restore)
    }

    fn in_teardown(&self) -> bool {
        matches!(self.state, HciState::RemoveGate | HciState::AppDeregister)
    }
}
