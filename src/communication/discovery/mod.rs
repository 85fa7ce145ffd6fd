//! Service Discovery Protocol.
//!
//! SDP lets a device publish records describing the services it offers and
//! lets peers query those records over an L2CAP channel on [`SDP_PSM`].
//!
//! * [`Server`] holds a local database of [`ServiceRecord`]s and answers
//!   requests on any [`Channel`](super::Channel) handed to it.
//! * [`Client`] issues ServiceSearchAttribute transactions over a channel,
//!   following continuation states until each response is complete.
//! * [`ServiceDiscoverer`] runs a set of registered searches against every
//!   peer it is given a client for, and reports results through callbacks.

use std::collections::BTreeMap;
use std::fmt::Debug;

use super::Psm;

pub use client::{Client, ClientOptions, SearchResults, DEFAULT_TRANSACTION_TIMEOUT};
pub use discoverer::{ResultCallback, SearchId, ServiceDiscoverer};
pub use error::{Error, ErrorCode, Result};
pub use pdu::{
    AttributeOrdering, AttributeRange, AttributeRanges, ErrorResponse, ParseStatus, Request,
    Response, ServiceAttributeRequest, ServiceAttributeResponse, ServiceSearchAttributeRequest,
    ServiceSearchAttributeResponse, ServiceSearchRequest, ServiceSearchResponse,
};
pub use record::{ProtocolListId, SecurityLevel, ServiceRecord, PRIMARY_PROTOCOL_LIST};
pub use serialization::{
    is_valid_url, DataElement, DataElementType, FromDataElement, PduId, TransactionId,
};
pub use server::{ConnectCallback, RegistrationHandle, Server};

mod client;
mod discoverer;
mod error;
mod pdu;
mod record;
mod serialization;
mod server;

pub type ServiceHandle = u32;

/// The attributes of one service record, ordered by id.
pub type AttributeMap = BTreeMap<AttributeId, DataElement>;

pub const SDP_PSM: Psm = 0x0001;
pub const RFCOMM_PSM: Psm = 0x0003;
pub const AVCTP_PSM: Psm = 0x0017;
pub const AVDTP_PSM: Psm = 0x0019;

/// Handle of the record describing the SDP server itself.
pub const SDP_HANDLE: ServiceHandle = 0x0000_0000;
/// Handles below this are reserved.
pub const FIRST_UNRESERVED_HANDLE: ServiceHandle = 0x0001_0000;

/// Most UUIDs a search pattern may hold.
pub const MAX_SERVICE_SEARCH_SIZE: usize = 12;
/// Most bytes of continuation information carried in one PDU.
pub const MAX_CONTINUATION_STATE_SIZE: usize = 16;
/// Smallest MaximumAttributeByteCount a request may ask for.
pub const MIN_MAXIMUM_ATTRIBUTE_BYTE_COUNT: u16 = 0x0007;
/// Largest attribute list a response may reassemble.
pub const MAX_SUPPORTED_ATTRIBUTE_LIST_BYTES: usize = 655_360;

/// Protocol UUIDs from the Bluetooth Assigned Numbers.
pub mod protocol {
    use crate::communication::Uuid;

    pub const SDP: Uuid = Uuid::from_u16(0x0001);
    pub const RFCOMM: Uuid = Uuid::from_u16(0x0003);
    pub const ATT: Uuid = Uuid::from_u16(0x0007);
    pub const OBEX: Uuid = Uuid::from_u16(0x0008);
    pub const BNEP: Uuid = Uuid::from_u16(0x000F);
    pub const AVCTP: Uuid = Uuid::from_u16(0x0017);
    pub const AVDTP: Uuid = Uuid::from_u16(0x0019);
    pub const L2CAP: Uuid = Uuid::from_u16(0x0100);
}

/// Service class and profile UUIDs from the Bluetooth Assigned Numbers.
pub mod service_class {
    use crate::communication::Uuid;

    pub const SERVICE_DISCOVERY_SERVER: Uuid = Uuid::from_u16(0x1000);
    pub const BROWSE_GROUP_DESCRIPTOR: Uuid = Uuid::from_u16(0x1001);
    pub const PUBLIC_BROWSE_ROOT: Uuid = Uuid::from_u16(0x1002);
    pub const SERIAL_PORT: Uuid = Uuid::from_u16(0x1101);
    pub const AUDIO_SOURCE: Uuid = Uuid::from_u16(0x110A);
    pub const AUDIO_SINK: Uuid = Uuid::from_u16(0x110B);
    pub const AV_REMOTE_CONTROL_TARGET: Uuid = Uuid::from_u16(0x110C);
    pub const ADVANCED_AUDIO_DISTRIBUTION: Uuid = Uuid::from_u16(0x110D);
    pub const AV_REMOTE_CONTROL: Uuid = Uuid::from_u16(0x110E);
    pub const HANDSFREE: Uuid = Uuid::from_u16(0x111E);
    pub const HANDSFREE_AUDIO_GATEWAY: Uuid = Uuid::from_u16(0x111F);
    pub const HUMAN_INTERFACE_DEVICE: Uuid = Uuid::from_u16(0x1124);
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u16);

impl Debug for AttributeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl From<u16> for AttributeId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl AttributeId {
    pub const SERVICE_RECORD_HANDLE: Self = Self(0x0000);
    pub const SERVICE_CLASS_ID_LIST: Self = Self(0x0001);
    pub const SERVICE_RECORD_STATE: Self = Self(0x0002);
    pub const SERVICE_ID: Self = Self(0x0003);
    pub const PROTOCOL_DESCRIPTOR_LIST: Self = Self(0x0004);
    pub const BROWSE_GROUP_LIST: Self = Self(0x0005);
    pub const LANGUAGE_BASE_ATTRIBUTE_ID_LIST: Self = Self(0x0006);
    pub const SERVICE_INFO_TIME_TO_LIVE: Self = Self(0x0007);
    pub const SERVICE_AVAILABILITY: Self = Self(0x0008);
    pub const BLUETOOTH_PROFILE_DESCRIPTOR_LIST: Self = Self(0x0009);
    pub const DOCUMENTATION_URL: Self = Self(0x000A);
    pub const CLIENT_EXECUTABLE_URL: Self = Self(0x000B);
    pub const ICON_URL: Self = Self(0x000C);
    pub const ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS: Self = Self(0x000D);

    // Only meaningful on the SDP server's own record.
    pub const VERSION_NUMBER_LIST: Self = Self(0x0200);
    pub const SERVICE_DATABASE_STATE: Self = Self(0x0201);

    /// Default base for the human-readable attributes of the primary language.
    pub const PRIMARY_LANGUAGE_BASE: Self = Self(0x0100);

    // Offsets from a language base.
    pub const SERVICE_NAME_OFFSET: u16 = 0x0000;
    pub const SERVICE_DESCRIPTION_OFFSET: u16 = 0x0001;
    pub const PROVIDER_NAME_OFFSET: u16 = 0x0002;

    pub fn offset(self, offset: u16) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}
