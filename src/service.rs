//! Serialized processing context
//!
//! `HciService` owns the NCI dispatcher and the host-control state machine
//! and feeds both from one input queue, so every handler runs to completion
//! before the next input is looked at. Timers are sleep tasks that post
//! their generation back into the same queue.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::{debug, error, info, warn};

use crate::core::{Error, PowerMode, Result, Status};
use crate::hci::{EeDiscoveryStatus, EeManager, HciAction, HciListener, HciRequest, HciTunables, HostControl};
use crate::nci::conn_id::STATIC_HCI;
use crate::nci::dispatch::Routed;
use crate::nci::{NciCodec, NciDispatcher, NciPacket};
use crate::transport::{Transport, TransportEvent};

/// Everything the service reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceInput {
    /// Raw bytes from the transport, possibly partial packets
    Nci(Bytes),
    /// A packet already framed by `pump`
    Packet(NciPacket),
    TimerExpired(u64),
    Api(HciRequest),
    PowerMode(PowerMode),
    EeStatus(EeDiscoveryStatus),
    ConnectionCreated { conn_id: u8, status: Status },
    Transport(TransportEvent),
    Shutdown,
}

/// Persistent storage for the host-control configuration blob
pub trait ConfigStore: Send {
    /// Stored bytes, `None` when nothing was stored yet
    fn load(&mut self) -> Result<Option<Vec<u8>>>;

    fn store(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Keeps the configuration in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    bytes: Option<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.bytes.clone())
    }

    fn store(&mut self, bytes: &[u8]) -> Result<()> {
        self.bytes = Some(bytes.to_vec());
        Ok(())
    }
}

/// Cloneable sender into a running service
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceInput>,
}

impl ServiceHandle {
    pub fn post(&self, input: ServiceInput) -> Result<()> {
        self.tx
            .send(input)
            .map_err(|_| Error::invalid_state("HCI service has stopped"))
    }

    /// Queues an application request
    pub fn request(&self, request: HciRequest) -> Result<()> {
        self.post(ServiceInput::Api(request))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(ServiceInput::Shutdown)
    }
}

/// Drives the host-control state machine
pub struct HciService<T: Transport, E: EeManager, S: ConfigStore> {
    dispatcher: NciDispatcher,
    codec: NciCodec,
    rx_buf: BytesMut,
    control: HostControl<E>,
    actions: mpsc::UnboundedReceiver<HciAction>,
    transport: T,
    store: S,
    listener: Option<Arc<dyn HciListener>>,
    input_tx: mpsc::UnboundedSender<ServiceInput>,
    input_rx: mpsc::UnboundedReceiver<ServiceInput>,
    timer: Option<JoinHandle<()>>,
    static_hci_bound: bool,
    shut_down: bool,
}

impl<T: Transport, E: EeManager, S: ConfigStore> HciService<T, E, S> {
    /// Creates a new service; nothing runs until `start`
    pub fn new(transport: T, ee: E, store: S, tunables: HciTunables, dispatcher: NciDispatcher) -> Self {
        let (action_tx, actions) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        HciService {
            dispatcher,
            codec: NciCodec::new(),
            rx_buf: BytesMut::new(),
            control: HostControl::new(ee, action_tx, tunables),
            actions,
            transport,
            store,
            listener: None,
            input_tx,
            input_rx,
            timer: None,
            static_hci_bound: false,
            shut_down: false,
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn HciListener>) {
        self.listener = Some(listener);
    }

    pub fn dispatcher_mut(&mut self) -> &mut NciDispatcher {
        &mut self.dispatcher
    }

    pub fn control(&self) -> &HostControl<E> {
        &self.control
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            tx: self.input_tx.clone(),
        }
    }

    /// Opens the transport and enables the host-control layer
    pub fn start(&mut self) -> Result<()> {
        self.transport.open()?;
        self.shut_down = false;
        self.control.enable();
        self.process_actions();
        Ok(())
    }

    /// Processes inputs until a shutdown is posted
    pub async fn run(mut self) -> Self {
        while let Some(input) = self.input_rx.recv().await {
            if input == ServiceInput::Shutdown {
                break;
            }
            self.handle_input(input);
        }
        self.shutdown();
        self
    }

    /// Handles one input and everything it sets off
    pub fn handle_input(&mut self, input: ServiceInput) {
        match input {
            ServiceInput::Nci(bytes) => self.on_bytes(&bytes),
            ServiceInput::Packet(packet) => self.route(packet),
            ServiceInput::TimerExpired(generation) => self.control.on_timer_expired(generation),
            ServiceInput::Api(request) => self.control.handle_request(request),
            ServiceInput::PowerMode(mode) => self.control.on_power_mode(mode),
            ServiceInput::EeStatus(status) => self.control.on_ee_status(status),
            ServiceInput::ConnectionCreated { conn_id, status } => {
                self.control.on_connection_created(conn_id, status)
            }
            ServiceInput::Transport(event) => {
                if event == TransportEvent::Error {
                    warn!("transport reported an error");
                }
                self.dispatcher.on_transport_event(event);
            }
            ServiceInput::Shutdown => self.shutdown(),
        }
        self.process_actions();
    }

    /// Disables the state machine and closes the transport; repeat calls
    /// do nothing
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.control.disable();
        self.process_actions();
        self.cancel_timer();
        if let Err(e) = self.transport.close() {
            warn!(error = %e, "transport close failed");
        }
        info!("HCI service stopped");
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.rx_buf.extend_from_slice(bytes);
        while let Some(packet) = self.codec.decode_skipping(&mut self.rx_buf) {
            self.route(packet);
        }
    }

    fn route(&mut self, packet: NciPacket) {
        match self.dispatcher.on_packet(packet) {
            Routed::Data { conn_id, payload } => {
                if conn_id == STATIC_HCI && !self.static_hci_bound {
                    debug!(len = payload.len(), "static HCI data before binding");
                    return;
                }
                self.control.on_hci_data(conn_id, &payload);
            }
            Routed::Consumed | Routed::Delivered => {}
            Routed::Ignored => debug!("NCI packet ignored"),
        }
    }

    fn process_actions(&mut self) {
        while let Ok(action) = self.actions.try_recv() {
            if let Err(e) = self.execute(action) {
                error!(error = %e, "HCI action failed");
            }
        }
    }

    fn execute(&mut self, action: HciAction) -> Result<()> {
        match action {
            HciAction::Transmit { conn_id, packet } => {
                let packet = NciPacket::data(conn_id, packet);
                if self.dispatcher.on_outbound(&packet) {
                    debug!(conn_id, "outbound packet consumed by vendor extension");
                    return Ok(());
                }
                let mut buf = BytesMut::new();
                self.codec.encode(packet, &mut buf)?;
                self.transport.send(&buf)?;
            }
            HciAction::StartTimer { generation, duration } => {
                self.cancel_timer();
                let tx = self.input_tx.clone();
                self.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = tx.send(ServiceInput::TimerExpired(generation));
                }));
            }
            HciAction::StopTimer => self.cancel_timer(),
            HciAction::Notify { app, event } => match &self.listener {
                Some(listener) => listener.on_hci_event(app, &event),
                None => debug!(?app, ?event, "no HCI listener"),
            },
            HciAction::LoadConfig => {
                let bytes = self.store.load().unwrap_or_else(|e| {
                    warn!(error = %e, "configuration store unreadable");
                    None
                });
                self.control.on_config_loaded(bytes.as_deref());
            }
            HciAction::PersistConfig(bytes) => self.store.store(&bytes)?,
            HciAction::BindStaticHci => {
                self.static_hci_bound = true;
                debug!("static HCI connection bound");
            }
            HciAction::SetNfceeMode { nfcee_id, activate } => {
                self.control.ee_mut().set_mode(nfcee_id, activate)?;
            }
            HciAction::StartRfDiscovery => {
                self.transport.pre_discover()?;
                self.control.ee_mut().start_rf_discovery()?;
            }
            HciAction::EnableComplete(status) => {
                if let Some(listener) = &self.listener {
                    listener.on_enable_complete(status);
                }
            }
            HciAction::PowerModeProcComplete => {
                if let Some(listener) = &self.listener {
                    listener.on_power_mode_complete();
                }
            }
        }
        Ok(())
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Frames NCI packets off `reader` and posts them to the service until the
/// reader ends
pub async fn pump<R>(reader: R, handle: ServiceHandle) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, SkippingCodec(NciCodec::new()));
    while let Some(packet) = frames.next().await {
        handle.post(ServiceInput::Packet(packet?))?;
    }
    Ok(())
}

/// Framing for `pump`. Malformed segments are skipped so the stream keeps
/// going; only reader errors end it.
struct SkippingCodec(NciCodec);

impl Decoder for SkippingCodec {
    type Item = NciPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<NciPacket>> {
        Ok(self.0.decode_skipping(src))
    }
}
