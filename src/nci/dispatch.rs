//! Routing of inbound NCI packets
//!
//! The dispatcher gives the vendor extension first refusal on every packet,
//! decodes the RF management notifications it understands and hands data
//! packets back to the caller for the host-control layer.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::activation::{self, ActivationRecord};
use super::codec::{MessageType, NciPacket};
use super::discovery::{self, DiscoveryRecord, DiscoveryResultSet};
use super::ee_action::{self, EeActionRecord};
use super::{gid, rf_oid};
use crate::core::Status;
use crate::transport::{NoVendorExtension, TransportEvent, VendorExtension};
use crate::util::hex;

/// Discovery side decode results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverEvent {
    /// An RF interface was activated, or the notification could not be decoded
    Activated(Result<ActivationRecord, Status>),
    /// One discovered target
    Result(Result<DiscoveryRecord, Status>),
    /// All targets of a discovery round, in arrival order
    RoundComplete(Vec<DiscoveryRecord>),
}

/// Response side decode results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// An NFCEE action; a failure carries no NFCEE id
    EeAction(Result<EeActionRecord, Status>),
}

/// Receives discovery decode results
pub trait DiscoveryListener: Send + Sync {
    fn on_discover_event(&self, event: &DiscoverEvent);
}

/// Receives response decode results
pub trait ResponseListener: Send + Sync {
    fn on_response_event(&self, event: &ResponseEvent);
}

/// What became of an inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// The vendor extension took it
    Consumed,
    /// Decoded and delivered to a listener
    Delivered,
    /// Payload of a data packet, for whoever owns the connection
    Data { conn_id: u8, payload: Bytes },
    /// Nothing here handles it
    Ignored,
}

/// Decodes inbound notifications and delivers them to listeners
pub struct NciDispatcher {
    vendor: Box<dyn VendorExtension>,
    discovery_listener: Option<Arc<dyn DiscoveryListener>>,
    response_listener: Option<Arc<dyn ResponseListener>>,
    results: DiscoveryResultSet,
}

impl Default for NciDispatcher {
    fn default() -> Self {
        NciDispatcher::new(Box::new(NoVendorExtension))
    }
}

impl NciDispatcher {
    /// Creates a dispatcher with the given vendor extension
    pub fn new(vendor: Box<dyn VendorExtension>) -> Self {
        NciDispatcher {
            vendor,
            discovery_listener: None,
            response_listener: None,
            results: DiscoveryResultSet::new(),
        }
    }

    pub fn set_discovery_listener(&mut self, listener: Arc<dyn DiscoveryListener>) {
        self.discovery_listener = Some(listener);
    }

    pub fn set_response_listener(&mut self, listener: Arc<dyn ResponseListener>) {
        self.response_listener = Some(listener);
    }

    /// Offers an outbound packet to the vendor extension; true if consumed
    /// and it must not reach the transport
    pub fn on_outbound(&mut self, packet: &NciPacket) -> bool {
        self.vendor.process_cmd(&packet.to_raw())
    }

    /// Forwards a transport lifecycle event to the vendor extension
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        self.vendor.on_transport_event(event);
        if matches!(event, TransportEvent::CloseComplete(_) | TransportEvent::Error) {
            self.results.clear();
        }
    }

    /// Routes one reassembled inbound packet
    pub fn on_packet(&mut self, packet: NciPacket) -> Routed {
        match packet.mt {
            MessageType::Data => {
                return Routed::Data {
                    conn_id: packet.conn_id(),
                    payload: packet.payload,
                }
            }
            MessageType::Response | MessageType::Notification => {
                if self.vendor.process_rsp_ntf(&packet.to_raw()) {
                    debug!(gid = packet.gid, oid = packet.oid, "packet consumed by vendor extension");
                    return Routed::Consumed;
                }
            }
            MessageType::Command => {
                warn!(gid = packet.gid, oid = packet.oid, "command received from controller");
                return Routed::Ignored;
            }
        }

        if packet.mt != MessageType::Notification || packet.gid != gid::RF_MANAGE {
            return Routed::Ignored;
        }

        match packet.oid {
            rf_oid::INTF_ACTIVATED => {
                let event = match activation::decode(&packet.payload) {
                    Ok(record) => Ok(record),
                    Err(e) => {
                        warn!(error = %e, payload = %hex(&packet.payload), "bad activation notification");
                        Err(Status::Failed)
                    }
                };
                self.results.clear();
                self.deliver_discover(DiscoverEvent::Activated(event));
            }
            rf_oid::DISCOVER => {
                match discovery::decode(&packet.to_raw()) {
                    Ok(record) => {
                        let round = self.results.push(record.clone());
                        self.deliver_discover(DiscoverEvent::Result(Ok(record)));
                        if let Some(round) = round {
                            self.deliver_discover(DiscoverEvent::RoundComplete(round));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, payload = %hex(&packet.payload), "bad discovery notification");
                        self.deliver_discover(DiscoverEvent::Result(Err(Status::Failed)));
                    }
                }
            }
            rf_oid::NFCEE_ACTION => {
                let event = match ee_action::decode(&packet.payload) {
                    Ok(record) => Ok(record),
                    Err(e) => {
                        warn!(error = %e, payload = %hex(&packet.payload), "bad NFCEE action notification");
                        Err(Status::Failed)
                    }
                };
                self.deliver_response(ResponseEvent::EeAction(event));
            }
            other => {
                debug!(oid = other, "unhandled RF management notification");
                return Routed::Ignored;
            }
        }
        Routed::Delivered
    }

    fn deliver_discover(&self, event: DiscoverEvent) {
        match &self.discovery_listener {
            Some(listener) => listener.on_discover_event(&event),
            None => debug!(?event, "no discovery listener"),
        }
    }

    fn deliver_response(&self, event: ResponseEvent) {
        match &self.response_listener {
            Some(listener) => listener.on_response_event(&event),
            None => debug!(?event, "no response listener"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        discover: Mutex<Vec<DiscoverEvent>>,
        response: Mutex<Vec<ResponseEvent>>,
    }

    impl DiscoveryListener for Recorder {
        fn on_discover_event(&self, event: &DiscoverEvent) {
            self.discover.lock().unwrap().push(event.clone());
        }
    }

    impl ResponseListener for Recorder {
        fn on_response_event(&self, event: &ResponseEvent) {
            self.response.lock().unwrap().push(event.clone());
        }
    }

    struct ConsumeAll;

    impl VendorExtension for ConsumeAll {
        fn process_rsp_ntf(&mut self, _packet: &[u8]) -> bool {
            true
        }
        fn process_cmd(&mut self, _packet: &[u8]) -> bool {
            true
        }
    }

    fn dispatcher() -> (NciDispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = NciDispatcher::default();
        dispatcher.set_discovery_listener(recorder.clone());
        dispatcher.set_response_listener(recorder.clone());
        (dispatcher, recorder)
    }

    fn ntf(oid: u8, payload: &[u8]) -> NciPacket {
        NciPacket::control(MessageType::Notification, gid::RF_MANAGE, oid, payload.to_vec())
    }

    #[test]
    fn test_short_activation_raises_one_failure() {
        let (mut dispatcher, recorder) = dispatcher();
        let routed = dispatcher.on_packet(ntf(rf_oid::INTF_ACTIVATED, &[1, 2, 3, 4, 5, 6]));
        assert_eq!(routed, Routed::Delivered);
        let events = recorder.discover.lock().unwrap();
        assert_eq!(*events, vec![DiscoverEvent::Activated(Err(Status::Failed))]);
    }

    #[test]
    fn test_discovery_round_is_delivered() {
        let (mut dispatcher, recorder) = dispatcher();
        dispatcher.on_packet(ntf(rf_oid::DISCOVER, &[0x01, 0x04, 0x00, 0x00, 0x02]));
        dispatcher.on_packet(ntf(rf_oid::DISCOVER, &[0x02, 0x02, 0x00, 0x00, 0x00]));

        let events = recorder.discover.lock().unwrap();
        assert_eq!(events.len(), 3);
        match &events[2] {
            DiscoverEvent::RoundComplete(round) => assert_eq!(round.len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_bad_discovery_is_a_failed_result() {
        let (mut dispatcher, recorder) = dispatcher();
        dispatcher.on_packet(ntf(rf_oid::DISCOVER, &[0x01, 0x02, 0x03, 0x01]));
        let events = recorder.discover.lock().unwrap();
        assert_eq!(*events, vec![DiscoverEvent::Result(Err(Status::Failed))]);
    }

    #[test]
    fn test_ee_action_failure() {
        let (mut dispatcher, recorder) = dispatcher();
        dispatcher.on_packet(ntf(rf_oid::NFCEE_ACTION, &[0x01, 0x02, 0x03]));
        let events = recorder.response.lock().unwrap();
        assert_eq!(*events, vec![ResponseEvent::EeAction(Err(Status::Failed))]);
    }

    #[test]
    fn test_vendor_extension_consumes() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = NciDispatcher::new(Box::new(ConsumeAll));
        dispatcher.set_discovery_listener(recorder.clone());

        let routed = dispatcher.on_packet(ntf(rf_oid::INTF_ACTIVATED, &[1, 2, 3]));
        assert_eq!(routed, Routed::Consumed);
        assert!(recorder.discover.lock().unwrap().is_empty());

        let cmd = NciPacket::control(MessageType::Command, gid::CORE, 0x00, vec![0x01]);
        assert!(dispatcher.on_outbound(&cmd));
    }

    #[test]
    fn test_data_packets_are_returned() {
        let (mut dispatcher, _) = dispatcher();
        let routed = dispatcher.on_packet(NciPacket::data(0x01, vec![0x81, 0x03]));
        assert_eq!(
            routed,
            Routed::Data { conn_id: 0x01, payload: Bytes::from_static(&[0x81, 0x03]) }
        );
    }

    #[test]
    fn test_other_groups_are_ignored() {
        let (mut dispatcher, recorder) = dispatcher();
        let packet = NciPacket::control(MessageType::Notification, gid::CORE, 0x06, vec![]);
        assert_eq!(dispatcher.on_packet(packet), Routed::Ignored);
        assert!(recorder.discover.lock().unwrap().is_empty());
    }
}
