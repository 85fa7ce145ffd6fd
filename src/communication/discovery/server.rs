use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::runtime::Handle;

use super::error::ErrorCode;
use super::pdu::{
    ErrorResponse, Request, Response, ServiceAttributeRequest, ServiceAttributeResponse,
    ServiceSearchAttributeRequest, ServiceSearchAttributeResponse, ServiceSearchRequest,
    ServiceSearchResponse,
};
use super::record::{ServiceRecord, PRIMARY_PROTOCOL_LIST};
use super::serialization::{DataElement, PduHeader, PduId, TransactionId};
use super::{
    protocol, service_class, AttributeId, AttributeMap, AttributeRanges, ServiceHandle,
    FIRST_UNRESERVED_HANDLE, RFCOMM_PSM, SDP_HANDLE, SDP_PSM,
};
use crate::communication::{Channel, ChannelAcceptor, ConnectionHandler, Psm, Uuid};

/// Identifies a group of records registered together. Zero means the
/// registration failed.
pub type RegistrationHandle = ServiceHandle;

/// Called with each channel opened to a registered service, along with the
/// protocol descriptor list that claimed the channel's PSM.
pub type ConnectCallback = Arc<dyn Fn(Channel, &DataElement) + Send + Sync>;

/// SDP version 1.0 as published in the VersionNumberList.
const SDP_VERSION: u16 = 0x0100;

/// An SDP server: a database of service records and the request handling
/// that exposes it to peers.
///
/// Cloning a `Server` yields another handle to the same database.
#[derive(Clone)]
pub struct Server {
    database: Arc<Mutex<Database>>,
}

struct Database {
    acceptor: Box<dyn ChannelAcceptor>,
    records: BTreeMap<ServiceHandle, ServiceRecord>,
    next_handle: ServiceHandle,
    psm_to_service: HashMap<Psm, BTreeSet<ServiceHandle>>,
    service_to_psms: HashMap<ServiceHandle, BTreeSet<Psm>>,
    registrations: HashMap<RegistrationHandle, BTreeSet<ServiceHandle>>,
    state: u32,
}

enum PsmLookup {
    NotL2cap,
    Psm(Psm),
    Unresolved,
}

fn lock(database: &Mutex<Database>) -> MutexGuard<'_, Database> {
    database.lock().unwrap_or_else(PoisonError::into_inner)
}

fn browse_group_list() -> DataElement {
    DataElement::Sequence(vec![DataElement::Uuid(service_class::PUBLIC_BROWSE_ROOT)])
}

fn sdp_record() -> ServiceRecord {
    let mut record = ServiceRecord::new();
    record.set_handle(SDP_HANDLE);
    record.set_service_class_uuids(&[service_class::SERVICE_DISCOVERY_SERVER]);
    record.add_protocol_descriptor(
        PRIMARY_PROTOCOL_LIST,
        protocol::L2CAP,
        DataElement::Uint16(SDP_PSM),
    );
    record.add_protocol_descriptor(PRIMARY_PROTOCOL_LIST, protocol::SDP, DataElement::Nil);
    record.set_attribute(AttributeId::BROWSE_GROUP_LIST, browse_group_list());
    record.set_attribute(
        AttributeId::VERSION_NUMBER_LIST,
        DataElement::Sequence(vec![DataElement::Uint16(SDP_VERSION)]),
    );
    record.set_attribute(AttributeId::SERVICE_DATABASE_STATE, DataElement::Uint32(0));
    record
}

/// Finds the PSM a protocol descriptor list listens on: the parameter of a
/// leading L2CAP descriptor, or the RFCOMM PSM when L2CAP has no parameter
/// and RFCOMM follows it.
fn find_protocol_list_psm(list: &DataElement) -> PsmLookup {
    let descriptor = match list.at(0) {
        Some(descriptor) => descriptor,
        None => return PsmLookup::NotL2cap,
    };
    if descriptor.at(0).and_then(|e| e.get::<Uuid>()) != Some(protocol::L2CAP) {
        return PsmLookup::NotL2cap;
    }

    match descriptor.at(1) {
        Some(param) => match param.get::<u16>() {
            Some(psm) => PsmLookup::Psm(psm),
            None => PsmLookup::Unresolved,
        },
        None => {
            let next = list.at(1).and_then(|d| d.at(0)).and_then(|e| e.get::<Uuid>());
            if next == Some(protocol::RFCOMM) {
                PsmLookup::Psm(RFCOMM_PSM)
            } else {
                PsmLookup::Unresolved
            }
        }
    }
}

async fn serve(database: Weak<Mutex<Database>>, mut channel: Channel) {
    while let Some(sdu) = channel.recv().await {
        let response = match database.upgrade() {
            Some(database) => Server { database }.handle_request(&sdu, channel.max_tx_sdu_size()),
            None => break,
        };

        if let Some(response) = response {
            if !channel.send(response) {
                debug!("sdp peer went away before the response was sent");
                break;
            }
        }
    }
    trace!("sdp connection closed");
}

impl Server {
    /// Creates a server holding only its own record, and starts accepting
    /// SDP connections through `acceptor`.
    ///
    /// Connections are served on the Tokio runtime current at construction,
    /// if any, otherwise on the runtime current when they arrive.
    pub fn new<A: ChannelAcceptor + 'static>(acceptor: A) -> Self {
        let mut records = BTreeMap::new();
        records.insert(SDP_HANDLE, sdp_record());

        let database = Arc::new(Mutex::new(Database {
            acceptor: Box::new(acceptor),
            records,
            next_handle: FIRST_UNRESERVED_HANDLE,
            psm_to_service: HashMap::new(),
            service_to_psms: HashMap::new(),
            registrations: HashMap::new(),
            state: 0,
        }));

        let weak = Arc::downgrade(&database);
        let runtime = Handle::try_current().ok();
        let on_connect: ConnectionHandler = Box::new(move |channel| {
            let task = serve(weak.clone(), channel);
            match &runtime {
                Some(runtime) => drop(runtime.spawn(task)),
                None => drop(tokio::spawn(task)),
            }
        });

        if !lock(&database).acceptor.register(SDP_PSM, on_connect) {
            warn!("couldn't listen for sdp connections on psm {:#06x}", SDP_PSM);
        }

        Self { database }
    }

    /// Serves SDP requests arriving on `channel` until it closes. Must be
    /// called from within a Tokio runtime.
    pub fn add_connection(&self, channel: Channel) {
        tokio::spawn(serve(Arc::downgrade(&self.database), channel));
    }

    /// Registers a group of records, all or nothing. Each record gets a fresh
    /// handle and is placed in the public browse group. Every PSM the records
    /// listen on is claimed through the acceptor, with connections delivered
    /// to `on_connect`.
    ///
    /// Returns the smallest handle assigned, which identifies the group for
    /// [`unregister_service`](Server::unregister_service), or 0 if any record
    /// was rejected.
    pub fn register_service(
        &self,
        records: Vec<ServiceRecord>,
        on_connect: ConnectCallback,
    ) -> RegistrationHandle {
        lock(&self.database).register_service(records, on_connect)
    }

    /// Removes a group of records, releasing any PSMs no other record uses.
    /// The server's own record cannot be removed.
    pub fn unregister_service(&self, handle: RegistrationHandle) -> bool {
        lock(&self.database).unregister_service(handle)
    }

    /// A copy of the record with `handle`.
    pub fn record(&self, handle: ServiceHandle) -> Option<ServiceRecord> {
        lock(&self.database).records.get(&handle).cloned()
    }

    /// Handles of every record containing all of `pattern`.
    pub fn search_services(&self, pattern: &BTreeSet<Uuid>) -> Vec<ServiceHandle> {
        lock(&self.database).search_services(pattern)
    }

    /// The attributes of record `handle` that fall in `ranges`.
    pub fn service_attributes(
        &self,
        handle: ServiceHandle,
        ranges: &AttributeRanges,
    ) -> Option<AttributeMap> {
        lock(&self.database).service_attributes(handle, ranges)
    }

    /// The attributes in `ranges` of every record containing all of
    /// `pattern`. Records with none of the attributes are left out.
    pub fn search_all_service_attributes(
        &self,
        pattern: &BTreeSet<Uuid>,
        ranges: &AttributeRanges,
    ) -> BTreeMap<ServiceHandle, AttributeMap> {
        lock(&self.database).search_all_service_attributes(pattern, ranges)
    }

    /// Answers one request SDU. Returns `None` for SDUs too short to carry a
    /// header, which are dropped.
    pub fn handle_request(&self, sdu: &[u8], max_tx_sdu_size: u16) -> Option<Bytes> {
        lock(&self.database).handle_request(sdu, max_tx_sdu_size)
    }
}

impl Database {
    fn is_allocated(&self, psm: Psm) -> bool {
        psm == SDP_PSM || self.psm_to_service.contains_key(&psm)
    }

    fn next_free_handle(&mut self, taken: &BTreeSet<ServiceHandle>) -> Option<ServiceHandle> {
        let mut candidate = self.next_handle;
        // one more try than there are used handles always finds a free one
        for _ in 0..=(self.records.len() + taken.len()) {
            if candidate < FIRST_UNRESERVED_HANDLE {
                candidate = FIRST_UNRESERVED_HANDLE;
            }
            let handle = candidate;
            candidate = candidate.wrapping_add(1);

            if !self.records.contains_key(&handle) && !taken.contains(&handle) {
                self.next_handle = candidate;
                return Some(handle);
            }
        }
        None
    }

    /// Checks `record` can be registered and queues the PSMs it would take.
    fn queue_service(
        &self,
        record: &ServiceRecord,
        queued: &mut Vec<(Psm, ServiceHandle, DataElement)>,
    ) -> bool {
        if !record.is_registerable() {
            warn!("record has no ServiceClassIDList");
            return false;
        }

        if let Some(list) = record.get_attribute(AttributeId::PROTOCOL_DESCRIPTOR_LIST) {
            match find_protocol_list_psm(list) {
                PsmLookup::NotL2cap => {
                    trace!("record {:#x} is not carried over l2cap", record.handle())
                }
                PsmLookup::Psm(psm) if self.is_allocated(psm) => {
                    warn!("psm {:#06x} is already allocated", psm);
                    return false;
                }
                PsmLookup::Psm(psm) => queued.push((psm, record.handle(), list.clone())),
                PsmLookup::Unresolved => {
                    warn!("couldn't find the psm of the primary protocol list");
                    return false;
                }
            }
        }

        if let Some(lists) =
            record.get_attribute(AttributeId::ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS)
        {
            let lists = match lists.as_slice() {
                Some(lists) => lists,
                None => {
                    warn!("AdditionalProtocolDescriptorLists is not a sequence");
                    return false;
                }
            };

            for list in lists {
                match find_protocol_list_psm(list) {
                    PsmLookup::Psm(psm) if !self.is_allocated(psm) => {
                        queued.push((psm, record.handle(), list.clone()))
                    }
                    _ => {
                        warn!("additional protocol list has no free psm");
                        return false;
                    }
                }
            }
        }

        true
    }

    fn register_service(
        &mut self,
        mut records: Vec<ServiceRecord>,
        on_connect: ConnectCallback,
    ) -> RegistrationHandle {
        if records.is_empty() {
            warn!("no records to register");
            return 0;
        }

        let saved_next_handle = self.next_handle;
        let mut assigned = BTreeSet::new();
        let mut queued = vec![];

        for record in records.iter_mut() {
            let handle = match self.next_free_handle(&assigned) {
                Some(handle) => handle,
                None => {
                    warn!("no free service handles");
                    self.next_handle = saved_next_handle;
                    return 0;
                }
            };
            assigned.insert(handle);
            record.set_handle(handle);
            record.set_attribute(AttributeId::BROWSE_GROUP_LIST, browse_group_list());

            if !self.queue_service(record, &mut queued) {
                self.next_handle = saved_next_handle;
                return 0;
            }
        }

        let registration = match assigned.iter().next() {
            Some(handle) => *handle,
            None => return 0,
        };

        let mut claimed: Vec<Psm> = vec![];
        for (psm, _, list) in &queued {
            if claimed.contains(psm) {
                continue;
            }

            let on_connect = on_connect.clone();
            let list = list.clone();
            let handler: ConnectionHandler = Box::new(move |channel| on_connect(channel, &list));
            if !self.acceptor.register(*psm, handler) {
                warn!("couldn't listen on psm {:#06x}", psm);
                for psm in claimed {
                    self.acceptor.unregister(psm);
                }
                self.next_handle = saved_next_handle;
                return 0;
            }
            claimed.push(*psm);
        }

        for (psm, handle, _) in queued {
            self.psm_to_service.entry(psm).or_default().insert(handle);
            self.service_to_psms.entry(handle).or_default().insert(psm);
        }
        for record in records {
            info!("registered service {:#010x}", record.handle());
            self.records.insert(record.handle(), record);
        }
        self.registrations.insert(registration, assigned);
        self.bump_state();

        registration
    }

    fn unregister_service(&mut self, handle: RegistrationHandle) -> bool {
        if handle == SDP_HANDLE {
            return false;
        }

        let handles = match self.registrations.remove(&handle) {
            Some(handles) => handles,
            None => {
                debug!("no registration {:#010x}", handle);
                return false;
            }
        };

        for handle in handles {
            info!("unregistering service {:#010x}", handle);
            self.records.remove(&handle);

            for psm in self.service_to_psms.remove(&handle).unwrap_or_default() {
                let released = match self.psm_to_service.get_mut(&psm) {
                    Some(services) => {
                        services.remove(&handle);
                        services.is_empty()
                    }
                    None => false,
                };
                if released {
                    self.psm_to_service.remove(&psm);
                    self.acceptor.unregister(psm);
                }
            }
        }

        self.bump_state();
        true
    }

    fn bump_state(&mut self) {
        self.state = self.state.wrapping_add(1);
        if let Some(record) = self.records.get_mut(&SDP_HANDLE) {
            record.set_attribute(
                AttributeId::SERVICE_DATABASE_STATE,
                DataElement::Uint32(self.state),
            );
        }
    }

    fn search_services(&self, pattern: &BTreeSet<Uuid>) -> Vec<ServiceHandle> {
        self.records
            .values()
            .filter(|record| record.find_uuid(pattern))
            .map(ServiceRecord::handle)
            .collect()
    }

    fn service_attributes(
        &self,
        handle: ServiceHandle,
        ranges: &AttributeRanges,
    ) -> Option<AttributeMap> {
        self.records
            .get(&handle)
            .map(|record| Self::collect_attributes(record, ranges))
    }

    fn search_all_service_attributes(
        &self,
        pattern: &BTreeSet<Uuid>,
        ranges: &AttributeRanges,
    ) -> BTreeMap<ServiceHandle, AttributeMap> {
        self.records
            .values()
            .filter(|record| record.find_uuid(pattern))
            .map(|record| (record.handle(), Self::collect_attributes(record, ranges)))
            .filter(|(_, attributes)| !attributes.is_empty())
            .collect()
    }

    fn collect_attributes(record: &ServiceRecord, ranges: &AttributeRanges) -> AttributeMap {
        let mut attributes = AttributeMap::new();
        for range in ranges.iter() {
            for id in record.attributes_in_range(range.start, range.end) {
                if let Some(value) = record.get_attribute(id) {
                    attributes.insert(id, value.clone());
                }
            }
        }
        attributes
    }

    fn error_response(tid: TransactionId, code: ErrorCode) -> Option<Bytes> {
        trace!("answering transaction {:#06x} with {:?}", tid, code);
        ErrorResponse::new(code).get_pdu(0, tid, 0, &[])
    }

    /// The fragment of `response` that `cont_state` asks for, or an error
    /// response if it can't be built.
    fn fragment<R: Response>(
        response: &R,
        req_max: u16,
        tid: TransactionId,
        max_tx_sdu_size: u16,
        cont_state: &[u8],
    ) -> Option<Bytes> {
        if let Some(pdu) = response.get_pdu(req_max, tid, max_tx_sdu_size, cont_state) {
            return Some(pdu);
        }

        if response.get_pdu(req_max, tid, max_tx_sdu_size, &[]).is_none() {
            warn!(
                "a {} byte sdu can't carry any part of the response to {:#06x}",
                max_tx_sdu_size, tid
            );
        } else {
            debug!(
                "continuation state {:02x?} in {:#06x} was never handed out",
                cont_state, tid
            );
        }
        Self::error_response(tid, ErrorCode::InvalidContinuationState)
    }

    fn handle_request(&self, sdu: &[u8], max_tx_sdu_size: u16) -> Option<Bytes> {
        let mut params = sdu;
        let header = match PduHeader::from_buf(&mut params) {
            Some(header) => header,
            None => {
                debug!("dropping {} byte sdu with no header", sdu.len());
                return None;
            }
        };
        let tid = header.tid;

        if header.parameter_length as usize != params.len() {
            return Self::error_response(tid, ErrorCode::InvalidPduSize);
        }

        match header.pdu_id() {
            Some(PduId::ServiceSearchRequest) => {
                let request = match ServiceSearchRequest::parse(params) {
                    Ok(request) if request.valid() => request,
                    _ => return Self::error_response(tid, ErrorCode::InvalidRequestSyntax),
                };

                let mut response = ServiceSearchResponse::new();
                response.set_service_record_handles(
                    self.search_services(request.service_search_pattern()),
                );
                Self::fragment(
                    &response,
                    request.max_service_record_count(),
                    tid,
                    max_tx_sdu_size,
                    request.continuation_state(),
                )
            }
            Some(PduId::ServiceAttributeRequest) => {
                let request = match ServiceAttributeRequest::parse(params) {
                    Ok(request) if request.valid() => request,
                    _ => return Self::error_response(tid, ErrorCode::InvalidRequestSyntax),
                };

                let attributes = match self
                    .service_attributes(request.service_record_handle(), request.attribute_ranges())
                {
                    Some(attributes) => attributes,
                    None => return Self::error_response(tid, ErrorCode::InvalidServiceRecordHandle),
                };

                let mut response = ServiceAttributeResponse::new();
                for (id, value) in attributes {
                    response.set_attribute(id, value);
                }
                Self::fragment(
                    &response,
                    request.max_attribute_byte_count(),
                    tid,
                    max_tx_sdu_size,
                    request.continuation_state(),
                )
            }
            Some(PduId::ServiceSearchAttributeRequest) => {
                let request = match ServiceSearchAttributeRequest::parse(params) {
                    Ok(request) if request.valid() => request,
                    _ => return Self::error_response(tid, ErrorCode::InvalidRequestSyntax),
                };

                let mut response = ServiceSearchAttributeResponse::new();
                let found = self.search_all_service_attributes(
                    request.service_search_pattern(),
                    request.attribute_ranges(),
                );
                for attributes in found.into_values() {
                    response.push_attribute_list(attributes);
                }
                Self::fragment(
                    &response,
                    request.max_attribute_byte_count(),
                    tid,
                    max_tx_sdu_size,
                    request.continuation_state(),
                )
            }
            other => {
                debug!("unexpected pdu {:?} (opcode {:#04x})", other, header.opcode);
                Self::error_response(tid, ErrorCode::InvalidRequestSyntax)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::channel::DEFAULT_MTU;
    use crate::communication::discovery::{ParseStatus, AVDTP_PSM};

    #[derive(Clone, Default)]
    struct TestAcceptor {
        handlers: Arc<Mutex<HashMap<Psm, ConnectionHandler>>>,
        refused: Arc<Mutex<BTreeSet<Psm>>>,
    }

    impl ChannelAcceptor for TestAcceptor {
        fn register(&mut self, psm: Psm, on_connect: ConnectionHandler) -> bool {
            if self.refused.lock().unwrap().contains(&psm) {
                return false;
            }
            let mut handlers = self.handlers.lock().unwrap();
            if handlers.contains_key(&psm) {
                return false;
            }
            handlers.insert(psm, on_connect);
            true
        }

        fn unregister(&mut self, psm: Psm) {
            self.handlers.lock().unwrap().remove(&psm);
        }
    }

    impl TestAcceptor {
        fn psms(&self) -> BTreeSet<Psm> {
            self.handlers.lock().unwrap().keys().copied().collect()
        }

        fn connect(&self, psm: Psm, channel: Channel) -> bool {
            match self.handlers.lock().unwrap().get_mut(&psm) {
                Some(handler) => {
                    handler(channel);
                    true
                }
                None => false,
            }
        }
    }

    fn ignore_connections() -> ConnectCallback {
        Arc::new(|_, _| {})
    }

    fn l2cap_record(class: Uuid, psm: Psm) -> ServiceRecord {
        let mut record = ServiceRecord::new();
        record.set_service_class_uuids(&[class]);
        record.add_protocol_descriptor(
            PRIMARY_PROTOCOL_LIST,
            protocol::L2CAP,
            DataElement::Uint16(psm),
        );
        record
    }

    fn error_code(pdu: &[u8]) -> ErrorCode {
        assert_eq!(pdu[0], PduId::ErrorResponse as u8);
        let mut response = ErrorResponse::default();
        response.parse(&pdu[5..]).unwrap();
        response.error_code().unwrap()
    }

    fn search_pdu(uuid: Uuid) -> Bytes {
        let mut request = ServiceSearchRequest::new();
        request.set_search_pattern(vec![uuid]);
        request.get_pdu(0x0101).unwrap()
    }

    fn search(server: &Server, uuid: Uuid) -> Vec<ServiceHandle> {
        let pdu = server.handle_request(&search_pdu(uuid), DEFAULT_MTU).unwrap();
        assert_eq!(pdu[0], PduId::ServiceSearchResponse as u8);
        assert_eq!(&pdu[1..3], &[0x01, 0x01]);
        let mut response = ServiceSearchResponse::new();
        assert_eq!(response.parse(&pdu[5..]), Ok(ParseStatus::Complete));
        response.service_record_handles().to_vec()
    }

    #[test]
    pub fn publishes_own_record() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());
        assert_eq!(acceptor.psms(), [SDP_PSM].into_iter().collect());

        assert_eq!(search(&server, service_class::SERVICE_DISCOVERY_SERVER), vec![SDP_HANDLE]);
        assert_eq!(search(&server, protocol::SDP), vec![SDP_HANDLE]);

        let record = server.record(SDP_HANDLE).unwrap();
        assert_eq!(
            record.get_attribute(AttributeId::VERSION_NUMBER_LIST),
            Some(&DataElement::Sequence(vec![DataElement::Uint16(0x0100)]))
        );
        assert_eq!(
            record.get_attribute(AttributeId::BROWSE_GROUP_LIST),
            Some(&browse_group_list())
        );
        assert!(!server.unregister_service(SDP_HANDLE));
    }

    #[test]
    pub fn registers_and_unregisters() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let mut record = l2cap_record(service_class::AUDIO_SINK, AVDTP_PSM);
        record.set_attribute(AttributeId::BROWSE_GROUP_LIST, DataElement::Nil);
        let handle = server.register_service(vec![record], ignore_connections());
        assert!(handle >= FIRST_UNRESERVED_HANDLE);
        assert!(acceptor.psms().contains(&AVDTP_PSM));

        let stored = server.record(handle).unwrap();
        assert_eq!(stored.handle(), handle);
        assert_eq!(
            stored.get_attribute(AttributeId::BROWSE_GROUP_LIST),
            Some(&browse_group_list())
        );
        assert_eq!(
            stored.get_attribute(AttributeId::SERVICE_RECORD_HANDLE),
            Some(&DataElement::Uint32(handle))
        );
        assert_eq!(search(&server, service_class::AUDIO_SINK), vec![handle]);
        assert_eq!(
            server
                .record(SDP_HANDLE)
                .unwrap()
                .get_attribute(AttributeId::SERVICE_DATABASE_STATE),
            Some(&DataElement::Uint32(1))
        );

        assert!(server.unregister_service(handle));
        assert!(!server.unregister_service(handle));
        assert!(server.record(handle).is_none());
        assert!(search(&server, service_class::AUDIO_SINK).is_empty());
        assert_eq!(acceptor.psms(), [SDP_PSM].into_iter().collect());
    }

    #[test]
    pub fn psm_collision_rejects_whole_registration() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let first = server.register_service(
            vec![l2cap_record(service_class::AUDIO_SINK, 500)],
            ignore_connections(),
        );
        assert_ne!(first, 0);

        let second = server.register_service(
            vec![
                l2cap_record(service_class::AUDIO_SOURCE, 600),
                l2cap_record(service_class::HANDSFREE, 500),
            ],
            ignore_connections(),
        );
        assert_eq!(second, 0);
        assert!(search(&server, service_class::AUDIO_SOURCE).is_empty());
        assert!(search(&server, service_class::HANDSFREE).is_empty());
        assert_eq!(acceptor.psms(), [SDP_PSM, 500].into_iter().collect());

        // the sdp psm is never available
        assert_eq!(
            server.register_service(
                vec![l2cap_record(service_class::SERIAL_PORT, SDP_PSM)],
                ignore_connections(),
            ),
            0
        );
    }

    #[test]
    pub fn psm_shared_within_one_registration() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let handle = server.register_service(
            vec![
                l2cap_record(service_class::AUDIO_SOURCE, 25),
                l2cap_record(service_class::AUDIO_SINK, 25),
            ],
            ignore_connections(),
        );
        assert_ne!(handle, 0);
        assert_eq!(search(&server, service_class::AUDIO_SOURCE), vec![handle]);
        assert_eq!(search(&server, service_class::AUDIO_SINK), vec![handle + 1]);
        assert_eq!(acceptor.psms(), [SDP_PSM, 25].into_iter().collect());

        assert!(server.unregister_service(handle));
        assert_eq!(acceptor.psms(), [SDP_PSM].into_iter().collect());
    }

    #[test]
    pub fn rejects_unregisterable_records() {
        let server = Server::new(TestAcceptor::default());

        assert_eq!(server.register_service(vec![], ignore_connections()), 0);
        assert_eq!(server.register_service(vec![ServiceRecord::new()], ignore_connections()), 0);

        // l2cap with a non-u16 parameter
        let mut record = ServiceRecord::new();
        record.set_service_class_uuids(&[service_class::SERIAL_PORT]);
        record.add_protocol_descriptor(
            PRIMARY_PROTOCOL_LIST,
            protocol::L2CAP,
            DataElement::Uint8(3),
        );
        assert_eq!(server.register_service(vec![record], ignore_connections()), 0);

        // l2cap with no parameter and nothing to infer it from
        let mut record = ServiceRecord::new();
        record.set_service_class_uuids(&[service_class::SERIAL_PORT]);
        record.add_protocol_descriptor(PRIMARY_PROTOCOL_LIST, protocol::L2CAP, DataElement::Nil);
        record.add_protocol_descriptor(PRIMARY_PROTOCOL_LIST, protocol::OBEX, DataElement::Nil);
        assert_eq!(server.register_service(vec![record], ignore_connections()), 0);
    }

    #[test]
    pub fn psm_inference() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let mut rfcomm = ServiceRecord::new();
        rfcomm.set_service_class_uuids(&[service_class::SERIAL_PORT]);
        rfcomm.add_protocol_descriptor(PRIMARY_PROTOCOL_LIST, protocol::L2CAP, DataElement::Nil);
        rfcomm.add_protocol_descriptor(
            PRIMARY_PROTOCOL_LIST,
            protocol::RFCOMM,
            DataElement::Uint8(5),
        );
        assert_ne!(server.register_service(vec![rfcomm], ignore_connections()), 0);
        assert!(acceptor.psms().contains(&RFCOMM_PSM));

        // not carried over l2cap: accepted, nothing to listen on
        let mut other = ServiceRecord::new();
        other.set_service_class_uuids(&[service_class::HUMAN_INTERFACE_DEVICE]);
        other.add_protocol_descriptor(PRIMARY_PROTOCOL_LIST, protocol::ATT, DataElement::Nil);
        assert_ne!(server.register_service(vec![other], ignore_connections()), 0);

        // no protocol list at all
        let mut bare = ServiceRecord::new();
        bare.set_service_class_uuids(&[service_class::HANDSFREE]);
        assert_ne!(server.register_service(vec![bare], ignore_connections()), 0);

        assert_eq!(acceptor.psms(), [SDP_PSM, RFCOMM_PSM].into_iter().collect());
    }

    #[test]
    pub fn additional_protocol_lists_claim_psms() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let mut record = l2cap_record(service_class::AV_REMOTE_CONTROL_TARGET, 0x0017);
        record.add_protocol_descriptor(1, protocol::L2CAP, DataElement::Uint16(0x001B));
        record.add_protocol_descriptor(1, protocol::AVCTP, DataElement::Uint16(0x0104));
        let handle = server.register_service(vec![record], ignore_connections());
        assert_ne!(handle, 0);
        assert_eq!(acceptor.psms(), [SDP_PSM, 0x0017, 0x001B].into_iter().collect());

        let mut clash = l2cap_record(service_class::AV_REMOTE_CONTROL, 0x0021);
        clash.add_protocol_descriptor(1, protocol::L2CAP, DataElement::Uint16(0x001B));
        assert_eq!(server.register_service(vec![clash], ignore_connections()), 0);

        assert!(server.unregister_service(handle));
        assert_eq!(acceptor.psms(), [SDP_PSM].into_iter().collect());
    }

    #[test]
    pub fn acceptor_refusal_rolls_back() {
        let acceptor = TestAcceptor::default();
        acceptor.refused.lock().unwrap().insert(0x0043);
        let server = Server::new(acceptor.clone());

        let handle = server.register_service(
            vec![
                l2cap_record(service_class::AUDIO_SINK, 0x0041),
                l2cap_record(service_class::AUDIO_SOURCE, 0x0043),
            ],
            ignore_connections(),
        );
        assert_eq!(handle, 0);
        assert_eq!(acceptor.psms(), [SDP_PSM].into_iter().collect());
        assert!(search(&server, service_class::AUDIO_SINK).is_empty());

        // the psm that was rolled back is free again
        assert_ne!(
            server.register_service(
                vec![l2cap_record(service_class::AUDIO_SINK, 0x0041)],
                ignore_connections(),
            ),
            0
        );
    }

    #[test]
    pub fn connections_reach_the_service() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let seen = Arc::new(Mutex::new(vec![]));
        let on_connect: ConnectCallback = {
            let seen = seen.clone();
            Arc::new(move |channel: Channel, protocol: &DataElement| {
                seen.lock().unwrap().push((channel.max_tx_sdu_size(), protocol.clone()));
            })
        };

        let record = l2cap_record(service_class::AUDIO_SINK, AVDTP_PSM);
        let expected = record
            .get_attribute(AttributeId::PROTOCOL_DESCRIPTOR_LIST)
            .cloned()
            .unwrap();
        assert_ne!(server.register_service(vec![record], on_connect), 0);

        let (_local, remote) = Channel::pair(100);
        assert!(acceptor.connect(AVDTP_PSM, remote));
        assert_eq!(*seen.lock().unwrap(), vec![(100, expected)]);
    }

    #[test]
    pub fn attribute_queries() {
        let server = Server::new(TestAcceptor::default());
        let sink = server.register_service(
            vec![l2cap_record(service_class::AUDIO_SINK, 0x0041)],
            ignore_connections(),
        );
        let source = server.register_service(
            vec![l2cap_record(service_class::AUDIO_SOURCE, 0x0043)],
            ignore_connections(),
        );

        let mut ranges = AttributeRanges::new();
        ranges.add_attribute(AttributeId::SERVICE_RECORD_HANDLE);
        ranges.add_attribute(AttributeId::SERVICE_CLASS_ID_LIST);

        let attributes = server.service_attributes(sink, &ranges).unwrap();
        assert_eq!(
            attributes.keys().copied().collect::<Vec<_>>(),
            vec![AttributeId::SERVICE_RECORD_HANDLE, AttributeId::SERVICE_CLASS_ID_LIST]
        );
        assert!(server.service_attributes(0x0BAD_0000, &ranges).is_none());

        let pattern = [protocol::L2CAP].into_iter().collect();
        let found = server.search_all_service_attributes(&pattern, &ranges);
        assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![SDP_HANDLE, sink, source]);

        // records without any requested attribute are left out
        let mut urls = AttributeRanges::new();
        urls.add_attribute(AttributeId::DOCUMENTATION_URL);
        assert!(server.search_all_service_attributes(&pattern, &urls).is_empty());
    }

    #[test]
    pub fn malformed_requests_get_error_responses() {
        let server = Server::new(TestAcceptor::default());

        assert!(server.handle_request(&[0x02, 0x00, 0x01, 0x00], DEFAULT_MTU).is_none());

        // parameter length disagrees with the sdu
        let pdu = server
            .handle_request(&[0x02, 0x00, 0x01, 0x00, 0x09, 0x35], DEFAULT_MTU)
            .unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidPduSize);
        assert_eq!(&pdu[1..3], &[0x00, 0x01]);

        // unknown opcode
        let pdu = server.handle_request(&[0x42, 0x00, 0x02, 0x00, 0x00], DEFAULT_MTU).unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidRequestSyntax);

        // a response sent to the server
        let pdu = server
            .handle_request(&[0x01, 0x00, 0x03, 0x00, 0x02, 0x00, 0x01], DEFAULT_MTU)
            .unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidRequestSyntax);

        // garbage parameters
        let pdu = server
            .handle_request(&[0x06, 0x00, 0x04, 0x00, 0x02, 0xff, 0xff], DEFAULT_MTU)
            .unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidRequestSyntax);
    }

    #[test]
    pub fn attribute_request_errors() {
        let server = Server::new(TestAcceptor::default());

        let mut request = ServiceAttributeRequest::new();
        request.set_service_record_handle(0x0BAD_0000);
        request.add_attribute(AttributeId::SERVICE_ID);
        let pdu = server.handle_request(&request.get_pdu(9).unwrap(), DEFAULT_MTU).unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidServiceRecordHandle);

        request.set_service_record_handle(SDP_HANDLE);
        request.set_continuation_state(&[0xff, 0xff, 0xff, 0xff]);
        let pdu = server.handle_request(&request.get_pdu(9).unwrap(), DEFAULT_MTU).unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidContinuationState);

        request.set_continuation_state(&[]);
        // no room for even a first fragment
        let pdu = server.handle_request(&request.get_pdu(9).unwrap(), 10).unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidContinuationState);

        let pdu = server.handle_request(&request.get_pdu(9).unwrap(), DEFAULT_MTU).unwrap();
        assert_eq!(pdu[0], PduId::ServiceAttributeResponse as u8);
        let mut response = ServiceAttributeResponse::new();
        assert_eq!(response.parse(&pdu[5..]), Ok(ParseStatus::Complete));
        assert_eq!(
            response.attributes().keys().copied().collect::<Vec<_>>(),
            vec![AttributeId::SERVICE_ID]
        );
    }

    #[test]
    pub fn search_attribute_request_follows_continuations() {
        let server = Server::new(TestAcceptor::default());
        let mut records = vec![];
        for i in 0..4u16 {
            let mut record = l2cap_record(service_class::AUDIO_SINK, 0x1001 + 2 * i);
            assert!(record.add_info("en", &format!("sink number {}", i), "a test sink", "acme"));
            records.push(record);
        }
        assert_ne!(server.register_service(records, ignore_connections()), 0);

        let mut request = ServiceSearchAttributeRequest::new();
        request.set_search_pattern(vec![service_class::AUDIO_SINK]);
        request.add_attribute_range(AttributeId(0x0000), AttributeId(0xFFFF));

        let mut response = ServiceSearchAttributeResponse::new();
        let mut fragments = 0;
        loop {
            let pdu = server.handle_request(&request.get_pdu(3).unwrap(), 48).unwrap();
            assert!(pdu.len() <= 48);
            assert_eq!(pdu[0], PduId::ServiceSearchAttributeResponse as u8);
            fragments += 1;
            match response.parse(&pdu[5..]).unwrap() {
                ParseStatus::Complete => break,
                ParseStatus::Continuing => {
                    assert!(request.set_continuation_state(response.continuation_state()))
                }
            }
        }

        assert!(fragments > 1);
        assert_eq!(response.num_attribute_lists(), 4);
        for (idx, attributes) in response.attribute_lists().iter().enumerate() {
            assert_eq!(
                attributes.get(&AttributeId(0x0100)),
                Some(&DataElement::from(format!("sink number {}", idx)))
            );
        }
    }

    #[tokio::test]
    pub async fn serves_connections() {
        let acceptor = TestAcceptor::default();
        let server = Server::new(acceptor.clone());

        let (mut local, remote) = Channel::pair(DEFAULT_MTU);
        assert!(acceptor.connect(SDP_PSM, remote));

        assert!(local.send(search_pdu(service_class::SERVICE_DISCOVERY_SERVER)));
        let pdu = local.recv().await.unwrap();
        assert_eq!(pdu[0], PduId::ServiceSearchResponse as u8);

        let (mut local, remote) = Channel::pair(DEFAULT_MTU);
        server.add_connection(remote);
        assert!(local.send(Bytes::from_static(&[0x07, 0x00, 0x00, 0x00, 0x00])));
        let pdu = local.recv().await.unwrap();
        assert_eq!(error_code(&pdu), ErrorCode::InvalidRequestSyntax);
    }
}
