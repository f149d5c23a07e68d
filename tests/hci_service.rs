use std::sync::{Arc, Mutex};

use bytes::Bytes;

use nfc_hci::core::{AppHandle, NfceeId, Status};
use nfc_hci::hci::{
    EeDiscoveryStatus, EeInfo, EeManager, EeStatus, HciEvent, HciListener, HciRequest, HciState, HciTunables,
};
use nfc_hci::nci::NciDispatcher;
use nfc_hci::transport::Transport;
use nfc_hci::{HciService, MemoryStore, Result, ServiceInput};

#[derive(Clone, Default)]
struct Wire {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Wire {
    /// HCP payload of the last NCI data packet written
    fn last_hcp(&self) -> Vec<u8> {
        let sent = self.sent.lock().unwrap();
        sent.last().map(|p| p[3..].to_vec()).unwrap_or_default()
    }
}

impl Transport for Wire {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Uicc;

impl EeManager for Uicc {
    fn nci_version(&self) -> u8 {
        0x10
    }

    fn ee_info(&self) -> Vec<EeInfo> {
        vec![EeInfo { nfcee_id: 0x02, status: EeStatus::Active, hci_access: true }]
    }

    fn create_connection(&mut self, _nfcee_id: NfceeId) -> Result<()> {
        Ok(())
    }

    fn stop_rf_discovery(&mut self) -> bool {
        false
    }

    fn start_rf_discovery(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_mode(&mut self, _nfcee_id: NfceeId, _activate: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<(Option<AppHandle>, HciEvent)>>);

impl Events {
    fn take(&self) -> Vec<(Option<AppHandle>, HciEvent)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl HciListener for Events {
    fn on_hci_event(&self, app: Option<AppHandle>, event: &HciEvent) {
        self.0.lock().unwrap().push((app, event.clone()));
    }
}

/// Wraps an HCP packet in an NCI data packet on the static HCI connection
fn hcp(packet: &[u8]) -> ServiceInput {
    let mut raw = vec![0x01, 0x00, packet.len() as u8];
    raw.extend_from_slice(packet);
    ServiceInput::Nci(Bytes::from(raw))
}

fn started(store: MemoryStore) -> (HciService<Wire, Uicc, MemoryStore>, Wire, Arc<Events>) {
    let wire = Wire::default();
    let events = Arc::new(Events::default());
    let mut service = HciService::new(wire.clone(), Uicc, store, HciTunables::default(), NciDispatcher::default());
    service.set_listener(events.clone());
    service.start().unwrap();
    service.handle_input(ServiceInput::EeStatus(EeDiscoveryStatus::Complete));
    assert_eq!(wire.last_hcp(), vec![0x81, 0x03]);
    service.handle_input(hcp(&[0x81, 0x80]));
    assert_eq!(wire.last_hcp(), vec![0x81, 0x02, 0x01]);
    (service, wire, events)
}

#[tokio::test]
async fn test_pipe_lifecycle_survives_restart() {
    let (mut service, wire, events) = started(MemoryStore::new());

    // Fresh configuration: the controller's session is replaced
    service.handle_input(hcp(&[0x81, 0x80, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]));
    service.handle_input(hcp(&[0x81, 0x80]));
    service.handle_input(hcp(&[0x81, 0x80, 0x00, 0x01, 0x02]));
    assert_eq!(service.control().state(), HciState::Idle);
    events.take();

    service.handle_input(ServiceInput::Api(HciRequest::Register { name: "wallet".into(), send_conn_evts: false }));
    let app = match events.take().as_slice() {
        [(_, HciEvent::Registered { status: Status::Ok, app: Some(app), .. })] => *app,
        other => panic!("unexpected events {:?}", other),
    };

    service.handle_input(ServiceInput::Api(HciRequest::AllocGate { app, gate: Some(0x20) }));
    assert_eq!(events.take(), vec![(Some(app), HciEvent::GateAllocated { status: Status::Ok, gate: 0x20 })]);

    // The UICC creates and opens a pipe to our gate, then sends a transaction event
    service.handle_input(hcp(&[0x81, 0x12, 0x02, 0x30, 0x01, 0x20, 0x21]));
    assert_eq!(wire.last_hcp(), vec![0x81, 0x80]);
    service.handle_input(hcp(&[0xA1, 0x03]));
    assert_eq!(wire.last_hcp(), vec![0xA1, 0x80]);
    service.handle_input(hcp(&[0xA1, 0x52, 0x81, 0x02]));

    let received = events.take();
    assert_eq!(received.len(), 3);
    assert_eq!(
        received[2],
        (
            Some(app),
            HciEvent::EventReceived { status: Status::Ok, pipe: 0x21, evt: 0x12, data: Bytes::from_static(&[0x81, 0x02]) }
        )
    );

    let session = service.control().config().session_id;
    service.shutdown();
    let store = service.store().clone();

    // Same session on restart keeps the pipe
    let (mut service, wire, _events) = started(store);
    let mut reply = vec![0x81, 0x80];
    reply.extend_from_slice(&session.0);
    service.handle_input(hcp(&reply));
    assert_eq!(wire.last_hcp(), vec![0x81, 0x02, 0x04]);
    service.handle_input(hcp(&[0x81, 0x80, 0x00, 0x01, 0x02]));

    assert_eq!(service.control().state(), HciState::Idle);
    assert!(service.control().config().find_pipe(0x21).is_some());
    assert_eq!(service.control().config().pipe_owner(0x21), Some(app));
}
